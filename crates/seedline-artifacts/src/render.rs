use seedline_db::{Record, Version};
use std::fmt::Write;

use crate::canonical::canonical_record;

/// Fixed header of every generated artifact.
pub const ARTIFACT_HEADER: &str = "\
# This file is generated by seedline after each data migration batch.
# It replays the current seed data into a fresh database; change data
# through migrations instead of editing it by hand.
";

/// One entity type's records, already restricted to the included fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub entity: String,
    pub table: String,
    pub records: Vec<Record>,
    /// Emit `reset_sequence(table)` after the records.
    pub reset_sequence: bool,
}

/// `Entity.create({..})` / `Entity.create!({..})` with sorted keys.
pub fn create_line(entity: &str, record: &Record, strict: bool) -> String {
    let method = if strict { "create!" } else { "create" };
    format!("{entity}.{method}({})", canonical_record(record))
}

pub fn bootstrap_line(version: Option<&Version>) -> String {
    match version {
        Some(v) => format!("bootstrap(\"{v}\")"),
        None => "bootstrap(null)".to_string(),
    }
}

/// Render the full artifact text. Pure: equal inputs give equal bytes.
pub fn render_artifact(sections: &[Section], max_version: Option<&Version>, strict: bool) -> String {
    let mut out = String::from(ARTIFACT_HEADER);
    out.push_str("transaction do\n");
    for section in sections {
        for record in &section.records {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "  {}", create_line(&section.entity, record, strict));
        }
        if section.reset_sequence {
            let _ = writeln!(out, "  reset_sequence({})", serde_json::Value::from(section.table.as_str()));
        }
    }
    out.push_str("end\n\n");
    out.push_str(&bootstrap_line(max_version));
    out.push('\n');
    out
}
