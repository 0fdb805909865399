//! Best-effort recovery of state the registry forgot.
//!
//! Both strategies answer one question per entity type and never fail:
//! no answer is `None`. The synthesizer only sees the trait.

use seedline_artifacts::ArtifactIndex;
use seedline_db::Version;
use std::collections::BTreeSet;
use std::fs;
use tracing::debug;

use crate::entity::EntityTable;
use crate::file::MigrationFile;

pub trait RecoveryStrategy<T>: Send + Sync {
    fn recover(&self, target: &EntityTable) -> Option<T>;
}

/// Origin version by scanning the source text of applied migrations.
///
/// Looks for creation calls, lookups and registrations of the entity
/// (`User.create`, `User::create`, `User.find`, `User.where`,
/// `User.delete`, `register User`) and for table DDL/DML
/// (`create_table("users")`, `create table users`,
/// `create table if not exists users`, `insert into users`, SQL matched
/// case-insensitively). The earliest matching version wins.
#[derive(Debug, Clone, Default)]
pub struct SourceScanOrigin {
    /// (version, source text), ascending by version.
    sources: Vec<(Version, String)>,
}

impl SourceScanOrigin {
    pub fn new(mut sources: Vec<(Version, String)>) -> Self {
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        Self { sources }
    }

    /// Read every file whose version is in `applied`.
    ///
    /// Invalid UTF-8 is decoded lossily; a file that cannot be read at all
    /// is skipped.
    pub fn from_files(files: &[MigrationFile], applied: &BTreeSet<Version>) -> Self {
        let mut sources = Vec::new();
        for f in files.iter().filter(|f| applied.contains(&f.version)) {
            match fs::read(&f.path) {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    sources.push((f.version.clone(), text));
                }
                Err(e) => {
                    debug!(path = ?f.path, error = %e, "migration source unreadable; skipped for origin scan");
                }
            }
        }
        Self::new(sources)
    }

    fn references(text: &str, lowered: &str, target: &EntityTable) -> bool {
        let e = &target.entity;
        // Method calls may continue (`find_by`, `create!`); only the start is anchored.
        let calls = [
            format!("{e}.create"),
            format!("{e}::create"),
            format!("{e}.find"),
            format!("{e}.where"),
            format!("{e}.delete"),
        ];
        if calls.iter().any(|n| contains_token(text, n, false))
            || contains_token(text, &format!("register {e}"), true)
        {
            return true;
        }

        let t = target.table.to_ascii_lowercase();
        let table_needles = [
            format!("create_table(\"{t}\")"),
            format!("create_table(:{t}"),
            format!("create table {t}"),
            format!("create table \"{t}\""),
            format!("create table if not exists {t}"),
            format!("create table if not exists \"{t}\""),
            format!("insert into {t}"),
            format!("insert into \"{t}\""),
        ];
        table_needles.iter().any(|n| contains_token(lowered, n, true))
    }
}

impl RecoveryStrategy<Version> for SourceScanOrigin {
    fn recover(&self, target: &EntityTable) -> Option<Version> {
        self.sources
            .iter()
            .find(|(_, text)| Self::references(text, &text.to_ascii_lowercase(), target))
            .map(|(v, _)| v.clone())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `needle` occurs with no identifier character directly before it (and,
/// with `closed`, none directly after it either).
fn contains_token(haystack: &str, needle: &str, closed: bool) -> bool {
    haystack.match_indices(needle).any(|(start, m)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + m.len()..].chars().next();
        !before.map(is_ident_char).unwrap_or(false)
            && !(closed && after.map(is_ident_char).unwrap_or(false))
    })
}

/// Field sets recorded in the previous artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactFieldRecovery<'a> {
    index: &'a ArtifactIndex,
}

impl<'a> ArtifactFieldRecovery<'a> {
    pub fn new(index: &'a ArtifactIndex) -> Self {
        Self { index }
    }
}

impl RecoveryStrategy<BTreeSet<String>> for ArtifactFieldRecovery<'_> {
    fn recover(&self, target: &EntityTable) -> Option<BTreeSet<String>> {
        self.index
            .fields(&target.entity)
            .filter(|f| !f.is_empty())
            .cloned()
    }
}

/// Strategy that never knows anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

impl<T> RecoveryStrategy<T> for NoRecovery {
    fn recover(&self, _target: &EntityTable) -> Option<T> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(entity: &str, table: &str) -> EntityTable {
        EntityTable {
            entity: entity.into(),
            table: table.into(),
        }
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn non_utf8_source_is_still_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_binary_blob.seed");
        let mut bytes = vec![0xff, 0xfe, 0x00, b'\n'];
        bytes.extend_from_slice(b"up do\n  User.create({})\nend\n");
        fs::write(&path, bytes).unwrap();
        let missing = dir.path().join("2_gone.seed");

        let files = vec![
            MigrationFile::from_path(&path).unwrap(),
            MigrationFile::from_path(&missing).unwrap(),
        ];
        let applied: BTreeSet<Version> = [v("1"), v("2")].into_iter().collect();
        let scan = SourceScanOrigin::from_files(&files, &applied);
        assert_eq!(scan.recover(&target("User", "users")), Some(v("1")));
    }

    #[test]
    fn earliest_referencing_version_wins() {
        let scan = SourceScanOrigin::new(vec![
            (v("3"), "up do\n  Role.create({\"name\":\"x\"})\nend\n".into()),
            (v("1"), "-- INSERT INTO roles (name) values ('a')".into()),
            (v("2"), "up do\n  User.create({})\nend\n".into()),
        ]);
        assert_eq!(scan.recover(&target("Role", "roles")), Some(v("1")));
        assert_eq!(scan.recover(&target("User", "users")), Some(v("2")));
        assert_eq!(scan.recover(&target("Tag", "tags")), None);
    }

    #[test]
    fn tokens_respect_identifier_boundaries() {
        assert!(contains_token("register User exclude x", "register User", true));
        assert!(!contains_token("register UserProfile", "register User", true));
        assert!(!contains_token("unregister User", "register User", true));
        assert!(!contains_token("AdminUser.create({})", "User.create", false));
        assert!(contains_token("  User.create!({})", "User.create", false));
        assert!(contains_token("User.find_by(name: 'x')", "User.find", false));
        assert!(!contains_token("insert into users_archive", "insert into users", true));
    }

    #[test]
    fn artifact_fields_ignore_empty_sets() {
        let idx = ArtifactIndex::parse("transaction do\n  User.create({\"id\":1})\nend\n");
        let rec = ArtifactFieldRecovery::new(&idx);
        assert_eq!(
            rec.recover(&target("User", "users")).map(|s| s.len()),
            Some(1)
        );
        assert_eq!(rec.recover(&target("Role", "roles")), None);
        assert_eq!(RecoveryStrategy::<Version>::recover(&NoRecovery, &target("User", "users")), None);
    }
}
