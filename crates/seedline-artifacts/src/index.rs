use seedline_db::Version;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::script::{parse_line, Statement};

/// What a previous artifact tells us: entity order, field selection and
/// the version it was bootstrapped to.
///
/// Parsing is tolerant: lines that do not parse are skipped, so a
/// hand-edited or partially corrupted artifact still yields whatever
/// structure remains readable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactIndex {
    order: Vec<String>,
    fields: BTreeMap<String, BTreeSet<String>>,
    bootstrap: Option<Version>,
}

impl ArtifactIndex {
    pub fn parse(text: &str) -> Self {
        let mut index = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            match parse_line(raw) {
                Ok(Some(Statement::Create { entity, record, .. })) => {
                    if !index.fields.contains_key(&entity) {
                        index.order.push(entity.clone());
                    }
                    index
                        .fields
                        .entry(entity)
                        .or_default()
                        .extend(record.into_keys());
                }
                Ok(Some(Statement::Bootstrap { version })) => index.bootstrap = version,
                Ok(_) => {}
                Err(e) => debug!(line = idx + 1, error = %format!("{e:#}"), "artifact line skipped"),
            }
        }
        index
    }

    /// Entity types in first-occurrence order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Union of field names across the entity's creation records.
    pub fn fields(&self, entity: &str) -> Option<&BTreeSet<String>> {
        self.fields.get(entity)
    }

    pub fn bootstrap_version(&self) -> Option<&Version> {
        self.bootstrap.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
