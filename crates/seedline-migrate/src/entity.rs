use anyhow::Result;
use seedline_config::SeedlineConfig;
use seedline_db::{is_internal_table, Store};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// A snapshot-eligible table and the entity type it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTable {
    pub entity: String,
    pub table: String,
}

/// Table <-> entity type naming, plus the set of tables never snapshotted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityNaming {
    overrides: BTreeMap<String, String>,
    excluded: BTreeSet<String>,
}

impl EntityNaming {
    pub fn new(overrides: BTreeMap<String, String>, excluded: impl IntoIterator<Item = String>) -> Self {
        Self {
            overrides,
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn from_config(config: &SeedlineConfig) -> Self {
        Self::new(config.entity_names.clone(), config.excluded_tables.iter().cloned())
    }

    /// Ledger, framework and configured exclusions.
    pub fn is_excluded(&self, table: &str) -> bool {
        is_internal_table(table) || self.excluded.contains(table)
    }

    pub fn entity_for_table(&self, table: &str) -> String {
        match self.overrides.get(table) {
            Some(name) => name.clone(),
            None => derive_entity_name(table),
        }
    }

    /// First non-excluded table (in the given order) whose entity name is `entity`.
    pub fn table_for<'t>(&self, entity: &str, tables: &'t [String]) -> Option<&'t str> {
        tables
            .iter()
            .filter(|t| !self.is_excluded(t))
            .find(|t| self.entity_for_table(t) == entity)
            .map(String::as_str)
    }
}

/// Every snapshot-eligible table with its entity name, sorted by table.
///
/// When two tables map to the same entity name the first one wins and the
/// other is skipped with a warning.
pub async fn entity_tables(store: &mut dyn Store, naming: &EntityNaming) -> Result<Vec<EntityTable>> {
    let mut tables = store.tables().await?;
    tables.sort();

    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let mut out = Vec::new();
    for table in tables {
        if naming.is_excluded(&table) {
            continue;
        }
        let entity = naming.entity_for_table(&table);
        if let Some(first) = seen.get(&entity) {
            warn!(entity = %entity, kept = %first, skipped = %table, "two tables map to one entity type");
            continue;
        }
        seen.insert(entity.clone(), table.clone());
        out.push(EntityTable { entity, table });
    }
    Ok(out)
}

/// `user_profiles` -> `UserProfile`, `categories` -> `Category`.
///
/// Only the last `_`-separated word is singularized.
pub fn derive_entity_name(table: &str) -> String {
    let parts: Vec<&str> = table.split('_').filter(|p| !p.is_empty()).collect();
    let last = parts.len().saturating_sub(1);
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let word = if i == last {
                singularize(part)
            } else {
                part.to_string()
            };
            capitalize(&word)
        })
        .collect()
}

fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.len() > 3 && lower.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    for suffix in ["sses", "xes", "ches", "shes"] {
        if lower.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if lower.len() > 1 && lower.ends_with('s') && !lower.ends_with("ss") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
