//! Snapshot synthesis.
//!
//! Rebuilds the artifact from live data, reconciling three partial sources
//! of "what goes in and in which order": the live registry, the previous
//! artifact, and the source of applied migrations.

use anyhow::Result;
use seedline_artifacts::{read_optional, render_artifact, write_atomic, ArtifactIndex, Section};
use seedline_config::SeedlineConfig;
use seedline_db::{Ledger, Record, Store, Version};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::entity::{entity_tables, EntityNaming, EntityTable};
use crate::error::MigrateError;
use crate::file::MigrationFile;
use crate::origin::{ArtifactFieldRecovery, RecoveryStrategy, SourceScanOrigin};
use crate::registry::{Registration, Registry};

/// Non-fatal findings of one synthesis run. Each is also logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisWarning {
    /// No registration and nothing recoverable: every column was included.
    FieldRecoveryFallback { entity: String },
    /// Entity types holding data without a registration, all of them at once.
    UnregisteredData { entities: Vec<String> },
    /// A registration names an entity type no table holds.
    UnknownRegisteredEntity { entity: String },
}

impl fmt::Display for SynthesisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldRecoveryFallback { entity } => write!(
                f,
                "{entity}: no registration and no recoverable field set; including all fields"
            ),
            Self::UnregisteredData { entities } => write!(
                f,
                "unregistered entity types hold data and were included: {}",
                entities.join(", ")
            ),
            Self::UnknownRegisteredEntity { entity } => {
                write!(f, "{entity} is registered but no table holds it")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSummary {
    pub entity: String,
    pub table: String,
    pub records: usize,
    /// Emitted field names, alphabetical.
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisReport {
    /// False when regeneration is disabled for this environment.
    pub written: bool,
    pub path: PathBuf,
    pub sections: Vec<SectionSummary>,
    pub warnings: Vec<SynthesisWarning>,
    pub max_version: Option<Version>,
}

impl SynthesisReport {
    fn skipped(path: &Path) -> Self {
        Self {
            written: false,
            path: path.to_path_buf(),
            sections: Vec::new(),
            warnings: Vec::new(),
            max_version: None,
        }
    }

    pub fn order(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.entity.as_str()).collect()
    }

    pub fn section(&self, entity: &str) -> Option<&SectionSummary> {
        self.sections.iter().find(|s| s.entity == entity)
    }
}

/// Rendered artifact text plus what went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub text: String,
    pub sections: Vec<SectionSummary>,
    pub warnings: Vec<SynthesisWarning>,
    pub max_version: Option<Version>,
}

#[derive(Debug, Clone)]
pub struct Synthesizer {
    artifact_path: PathBuf,
    enabled: bool,
    ignore_ids: bool,
    strict_create: bool,
    naming: EntityNaming,
    ledger: Ledger,
}

impl Synthesizer {
    pub fn from_config(config: &SeedlineConfig) -> Self {
        Self {
            artifact_path: config.artifact_path.clone(),
            enabled: config.artifact_enabled(),
            ignore_ids: config.ignore_ids,
            strict_create: config.strict_create,
            naming: EntityNaming::from_config(config),
            ledger: Ledger::new(config.ledger_write_policy),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Regenerate the artifact, or do nothing at all when disabled.
    pub async fn synthesize(
        &self,
        store: &mut dyn Store,
        registry: &Registry,
        files: &[MigrationFile],
    ) -> Result<SynthesisReport> {
        if !self.enabled {
            debug!(path = %self.artifact_path.display(), "artifact regeneration disabled here; skipped");
            return Ok(SynthesisReport::skipped(&self.artifact_path));
        }

        let previous = read_optional(&self.artifact_path)?.unwrap_or_default();
        let index = ArtifactIndex::parse(&previous);
        let applied = self.ledger.all_versions(store).await?;
        let origin = SourceScanOrigin::from_files(files, &applied);
        let fields = ArtifactFieldRecovery::new(&index);

        let out = self.build(store, registry, &index, &origin, &fields).await?;

        write_atomic(&self.artifact_path, &out.text).map_err(|e| MigrateError::ArtifactWriteFailure {
            path: self.artifact_path.clone(),
            reason: format!("{e:#}"),
        })?;
        info!(
            path = %self.artifact_path.display(),
            sections = out.sections.len(),
            "artifact written"
        );

        Ok(SynthesisReport {
            written: true,
            path: self.artifact_path.clone(),
            sections: out.sections,
            warnings: out.warnings,
            max_version: out.max_version,
        })
    }

    /// Produce the artifact text without touching the file system.
    pub async fn build(
        &self,
        store: &mut dyn Store,
        registry: &Registry,
        index: &ArtifactIndex,
        origin: &dyn RecoveryStrategy<Version>,
        fields: &dyn RecoveryStrategy<BTreeSet<String>>,
    ) -> Result<Synthesis> {
        let tables = entity_tables(store, &self.naming).await?;
        let by_entity: BTreeMap<&str, &EntityTable> =
            tables.iter().map(|t| (t.entity.as_str(), t)).collect();
        let mut warnings = Vec::new();

        let mut registered: Vec<&Registration> = Vec::new();
        for reg in registry.all() {
            if by_entity.contains_key(reg.entity.as_str()) {
                registered.push(reg);
            } else {
                warnings.push(SynthesisWarning::UnknownRegisteredEntity {
                    entity: reg.entity.clone(),
                });
            }
        }

        let mut unregistered: Vec<&EntityTable> = Vec::new();
        for t in &tables {
            if !registry.contains(&t.entity) && store.has_rows(&t.table).await? {
                unregistered.push(t);
            }
        }
        if !unregistered.is_empty() {
            let mut entities: Vec<String> = unregistered.iter().map(|t| t.entity.clone()).collect();
            entities.sort();
            warnings.push(SynthesisWarning::UnregisteredData { entities });
        }

        let order = self.order(index, &registered, &unregistered, origin);

        let mut sections = Vec::new();
        let mut summaries = Vec::new();
        for entity in &order {
            let Some(et) = by_entity.get(entity.as_str()).copied() else {
                continue;
            };
            let columns = store.columns(&et.table).await?;
            let pk = store.primary_key(&et.table).await?;

            let included: BTreeSet<String> = match registry.get(entity) {
                Some(reg) => reg.included_fields(&columns).into_iter().collect(),
                None => {
                    let recovered = fields
                        .recover(et)
                        .map(|set| {
                            columns
                                .iter()
                                .filter(|c| set.contains(*c) || pk.as_deref() == Some(c.as_str()))
                                .cloned()
                                .collect::<BTreeSet<String>>()
                        })
                        .filter(|set| !set.is_empty());
                    match recovered {
                        Some(set) => set,
                        None => {
                            warnings.push(SynthesisWarning::FieldRecoveryFallback {
                                entity: entity.clone(),
                            });
                            columns.iter().cloned().collect()
                        }
                    }
                }
            };

            let emitted: BTreeSet<String> = included
                .into_iter()
                .filter(|c| !(self.ignore_ids && pk.as_deref() == Some(c.as_str())))
                .collect();

            let records: Vec<Record> = store
                .rows(&et.table)
                .await?
                .into_iter()
                .map(|row| row.into_iter().filter(|(k, _)| emitted.contains(k)).collect())
                .collect();

            summaries.push(SectionSummary {
                entity: et.entity.clone(),
                table: et.table.clone(),
                records: records.len(),
                fields: emitted.into_iter().collect(),
            });
            sections.push(Section {
                entity: et.entity.clone(),
                table: et.table.clone(),
                records,
                reset_sequence: !self.ignore_ids && pk.is_some(),
            });
        }

        for w in &warnings {
            warn!("{w}");
        }

        let max_version = self.ledger.max_version(store).await?;
        let text = render_artifact(&sections, max_version.as_ref(), self.strict_create);
        Ok(Synthesis {
            text,
            sections: summaries,
            warnings,
            max_version,
        })
    }

    /// Previous artifact order first, then new registrations by origin, then
    /// unregistered types by resolved origin. Unknown origins go last.
    fn order(
        &self,
        index: &ArtifactIndex,
        registered: &[&Registration],
        unregistered: &[&EntityTable],
        origin: &dyn RecoveryStrategy<Version>,
    ) -> Vec<String> {
        let wanted: BTreeSet<&str> = registered
            .iter()
            .map(|r| r.entity.as_str())
            .chain(unregistered.iter().map(|t| t.entity.as_str()))
            .collect();

        let mut order: Vec<String> = Vec::new();
        for entity in index.order() {
            if wanted.contains(entity.as_str()) && !order.contains(entity) {
                order.push(entity.clone());
            }
        }

        let mut fresh: Vec<&Registration> = registered
            .iter()
            .filter(|r| !order.contains(&r.entity))
            .copied()
            .collect();
        // Stable: registrations without an origin keep registry order.
        fresh.sort_by(|a, b| cmp_origin(a.origin.as_ref(), b.origin.as_ref()));
        order.extend(fresh.into_iter().map(|r| r.entity.clone()));

        let mut rest: Vec<(Option<Version>, &EntityTable)> = unregistered
            .iter()
            .filter(|t| !order.contains(&t.entity))
            .map(|t| (origin.recover(t), *t))
            .collect();
        rest.sort_by(|a, b| {
            cmp_origin(a.0.as_ref(), b.0.as_ref()).then_with(|| a.1.entity.cmp(&b.1.entity))
        });
        order.extend(rest.into_iter().map(|(_, t)| t.entity.clone()));

        order
    }
}

/// Known versions ascending, unknown after all of them.
fn cmp_origin(a: Option<&Version>, b: Option<&Version>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn unknown_origin_sorts_last() {
        let mut xs = vec![None, Some(v("20")), Some(v("3"))];
        xs.sort_by(|a, b| cmp_origin(a.as_ref(), b.as_ref()));
        assert_eq!(xs, vec![Some(v("3")), Some(v("20")), None]);
    }
}
