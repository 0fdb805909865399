//! Registration registry: which entity types belong in the snapshot.
//!
//! Process-lifetime only. A new process starts empty and fills it again by
//! executing (or replaying) migrations.

use seedline_db::Version;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub entity: String,
    pub excluded: BTreeSet<String>,
    /// Version of the migration that was executing when this was made.
    pub origin: Option<Version>,
}

impl Registration {
    /// `columns` minus the excluded fields, in the given column order.
    pub fn included_fields(&self, columns: &[String]) -> Vec<String> {
        columns
            .iter()
            .filter(|c| !self.excluded.contains(*c))
            .cloned()
            .collect()
    }
}

/// Registrations keyed by entity type, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    entries: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity`. Last write wins; a replaced entry keeps its
    /// original position.
    pub fn register<I, S>(&mut self, entity: &str, exclude: I, origin: Option<Version>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reg = Registration {
            entity: entity.to_string(),
            excluded: exclude.into_iter().map(Into::into).collect(),
            origin,
        };
        match self.entries.iter_mut().find(|r| r.entity == entity) {
            Some(existing) => *existing = reg,
            None => self.entries.push(reg),
        }
    }

    /// Returns the removed entry, if any.
    pub fn unregister(&mut self, entity: &str) -> Option<Registration> {
        let pos = self.entries.iter().position(|r| r.entity == entity)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, entity: &str) -> Option<&Registration> {
        self.entries.iter().find(|r| r.entity == entity)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.get(entity).is_some()
    }

    pub fn all(&self) -> &[Registration] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Option<Version> {
        Some(Version::parse(s).unwrap())
    }

    #[test]
    fn reregister_replaces_in_place() {
        let mut r = Registry::new();
        r.register("User", ["secret"], v("1"));
        r.register("Role", Vec::<String>::new(), None);
        r.register("User", Vec::<String>::new(), v("3"));

        let names: Vec<&str> = r.all().iter().map(|e| e.entity.as_str()).collect();
        assert_eq!(names, ["User", "Role"]);
        let user = r.get("User").unwrap();
        assert!(user.excluded.is_empty());
        assert_eq!(user.origin, v("3"));
    }

    #[test]
    fn included_fields_never_exceed_columns() {
        let mut r = Registry::new();
        r.register("User", ["secret", "not_a_column"], None);
        let cols: Vec<String> = ["id", "secret", "username"].iter().map(|s| s.to_string()).collect();
        assert_eq!(r.get("User").unwrap().included_fields(&cols), ["id", "username"]);
    }

    #[test]
    fn unregister_removes() {
        let mut r = Registry::new();
        r.register("User", Vec::<String>::new(), None);
        assert!(r.unregister("User").is_some());
        assert!(r.unregister("User").is_none());
        assert!(r.is_empty());
    }
}
