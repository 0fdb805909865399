//! Migrations as code.
//!
//! A [`Migration`] is produced from a [`MigrationFile`] by a
//! [`MigrationLoader`]. Script files (`.seed`) are handled by
//! [`ScriptLoader`]; compiled migrations live in a [`Catalog`].

use anyhow::{anyhow, bail, Context, Result};
use seedline_artifacts::{parse_script, BlockKind, Spanned, Statement};
use seedline_db::{Record, Store, Version};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tracing::warn;

use crate::entity::EntityNaming;
use crate::error::{CatalogError, MigrateError};
use crate::file::{MigrationFile, SCRIPT_EXTENSION};
use crate::registry::Registry;

/// Registry change declared by a migration up front.
///
/// Declarations can be replayed without executing the migration, which is
/// how a fresh process rebuilds the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Register { entity: String, exclude: Vec<String> },
    Unregister { entity: String },
}

impl Declaration {
    pub fn apply(&self, registry: &mut Registry, origin: Option<Version>) {
        match self {
            Declaration::Register { entity, exclude } => {
                registry.register(entity, exclude.iter().cloned(), origin)
            }
            Declaration::Unregister { entity } => {
                registry.unregister(entity);
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Migration: Send + Sync {
    /// Declared registrations, applied with this migration's version as origin.
    fn declarations(&self) -> Vec<Declaration> {
        Vec::new()
    }

    async fn up(&self, cx: &mut MigrationContext<'_>) -> Result<()>;

    async fn down(&self, cx: &mut MigrationContext<'_>) -> Result<()>;
}

/// Everything a running migration may touch.
///
/// The executing migration's version travels here explicitly; registrations
/// made through the context get it as their origin.
pub struct MigrationContext<'a> {
    store: &'a mut dyn Store,
    registry: &'a mut Registry,
    naming: &'a EntityNaming,
    version: Option<Version>,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        store: &'a mut dyn Store,
        registry: &'a mut Registry,
        naming: &'a EntityNaming,
        version: Option<Version>,
    ) -> Self {
        Self {
            store,
            registry,
            naming,
            version,
        }
    }

    /// `None` outside migration execution (seed replay).
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn store(&mut self) -> &mut dyn Store {
        &mut *self.store
    }

    pub fn registry(&self) -> &Registry {
        &*self.registry
    }

    pub fn register<I, S>(&mut self, entity: &str, exclude: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.register(entity, exclude, self.version.clone());
    }

    pub fn unregister(&mut self, entity: &str) {
        self.registry.unregister(entity);
    }

    pub async fn table_for(&mut self, entity: &str) -> Result<String> {
        let tables = self.store.tables().await?;
        self.naming
            .table_for(entity, &tables)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no table holds entity type {entity}"))
    }

    /// Insert one record of `entity`.
    ///
    /// When the record carries a primary key that already exists, `strict`
    /// fails and non-strict skips with a warning. Returns whether a row was
    /// inserted.
    pub async fn create(&mut self, entity: &str, record: &Record, strict: bool) -> Result<bool> {
        let table = self.table_for(entity).await?;
        if let Some(pk) = self.store.primary_key(&table).await? {
            if let Some(key) = record.get(&pk).filter(|v| !v.is_null()) {
                let mut filter = Record::new();
                filter.insert(pk.clone(), key.clone());
                if self.store.exists(&table, &filter).await? {
                    if strict {
                        bail!("{entity} with {pk}={key} already exists");
                    }
                    warn!(entity = %entity, key = %key, "record already exists; create skipped");
                    return Ok(false);
                }
            }
        }
        self.store
            .insert(&table, record)
            .await
            .with_context(|| format!("{entity}.create"))?;
        Ok(true)
    }

    pub async fn delete(&mut self, entity: &str, filter: &Record) -> Result<u64> {
        if filter.is_empty() {
            bail!("{entity}.delete needs a non-empty filter");
        }
        let table = self.table_for(entity).await?;
        self.store
            .delete(&table, filter)
            .await
            .with_context(|| format!("{entity}.delete"))
    }

    pub async fn reset_sequence(&mut self, table: &str) -> Result<()> {
        self.store.reset_sequence(table).await
    }

    /// Execute one parsed script statement.
    pub async fn execute(&mut self, spanned: &Spanned) -> Result<()> {
        let res = match &spanned.stmt {
            Statement::Register { entity, exclude } => {
                self.register(entity, exclude.iter().cloned());
                Ok(())
            }
            Statement::Unregister { entity } => {
                self.unregister(entity);
                Ok(())
            }
            Statement::Create {
                entity,
                record,
                strict,
            } => self.create(entity, record, *strict).await.map(|_| ()),
            Statement::Delete { entity, filter } => self.delete(entity, filter).await.map(|_| ()),
            Statement::ResetSequence { table } => self.reset_sequence(table).await,
            other => Err(anyhow!("{other:?} cannot be executed here")),
        };
        res.with_context(|| format!("line {}", spanned.line))
    }
}

/// Turns a migration file into an executable migration.
pub trait MigrationLoader: Send + Sync {
    fn load(&self, file: &MigrationFile) -> Result<Arc<dyn Migration>>;
}

/// Migration backed by a `.seed` script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptMigration {
    declarations: Vec<Declaration>,
    up: Vec<Spanned>,
    down: Vec<Spanned>,
}

impl ScriptMigration {
    pub fn parse(text: &str) -> Result<Self> {
        let script = parse_script(text)?;

        let mut declarations = Vec::new();
        for s in script.top_level {
            match s.stmt {
                Statement::Register { entity, exclude } => {
                    declarations.push(Declaration::Register { entity, exclude })
                }
                Statement::Unregister { entity } => {
                    declarations.push(Declaration::Unregister { entity })
                }
                other => bail!(
                    "line {}: {other:?} must be inside an `up` or `down` block",
                    s.line
                ),
            }
        }

        let mut up = Vec::new();
        let mut down = Vec::new();
        for block in script.blocks {
            for s in &block.body {
                if matches!(s.stmt, Statement::Bootstrap { .. }) {
                    bail!("line {}: bootstrap is only valid in artifacts", s.line);
                }
            }
            match block.kind {
                BlockKind::Up => up = block.body,
                BlockKind::Down => down = block.body,
                BlockKind::Transaction => bail!(
                    "line {}: migrations use `up do` / `down do`, not `transaction do`",
                    block.line
                ),
            }
        }

        Ok(Self {
            declarations,
            up,
            down,
        })
    }
}

#[async_trait::async_trait]
impl Migration for ScriptMigration {
    fn declarations(&self) -> Vec<Declaration> {
        self.declarations.clone()
    }

    async fn up(&self, cx: &mut MigrationContext<'_>) -> Result<()> {
        for s in &self.up {
            cx.execute(s).await?;
        }
        Ok(())
    }

    async fn down(&self, cx: &mut MigrationContext<'_>) -> Result<()> {
        for s in &self.down {
            cx.execute(s).await?;
        }
        Ok(())
    }
}

/// Loads `.seed` script files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptLoader;

impl MigrationLoader for ScriptLoader {
    fn load(&self, file: &MigrationFile) -> Result<Arc<dyn Migration>> {
        if file.extension() != Some(SCRIPT_EXTENSION) {
            return Err(MigrateError::MissingMigration {
                version: file.version.clone(),
                path: file.path.clone(),
            }
            .into());
        }
        let text = fs::read_to_string(&file.path)
            .with_context(|| format!("read migration {:?}", file.path))?;
        let migration = ScriptMigration::parse(&text)
            .with_context(|| format!("parse migration {}", file.file_name()))?;
        Ok(Arc::new(migration))
    }
}

/// Compiled migrations keyed by version.
#[derive(Default)]
pub struct Catalog {
    entries: BTreeMap<Version, Arc<dyn Migration>>,
    fallback: Option<Box<dyn MigrationLoader>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `loader` for files the catalog has no entry for.
    pub fn with_fallback(mut self, loader: impl MigrationLoader + 'static) -> Self {
        self.fallback = Some(Box::new(loader));
        self
    }

    pub fn register<M>(&mut self, version: Version, migration: M) -> Result<(), CatalogError>
    where
        M: Migration + 'static,
    {
        if self.entries.contains_key(&version) {
            return Err(CatalogError::DuplicateVersion { version });
        }
        self.entries.insert(version, Arc::new(migration));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MigrationLoader for Catalog {
    fn load(&self, file: &MigrationFile) -> Result<Arc<dyn Migration>> {
        if let Some(m) = self.entries.get(&file.version) {
            return Ok(Arc::clone(m));
        }
        match &self.fallback {
            Some(loader) => loader.load(file),
            None => Err(MigrateError::MissingMigration {
                version: file.version.clone(),
                path: file.path.clone(),
            }
            .into()),
        }
    }
}

/// Build a record from a JSON object literal.
pub fn record(v: Value) -> Result<Record> {
    match v {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("expected a JSON object, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_declarations_and_blocks() {
        let m = ScriptMigration::parse(
            "register User exclude secret\n\
             up do\n  User.create({\"username\":\"bob\"})\nend\n\
             down do\n  User.delete({\"username\":\"bob\"})\nend\n",
        )
        .unwrap();
        assert_eq!(
            m.declarations(),
            vec![Declaration::Register {
                entity: "User".into(),
                exclude: vec!["secret".into()],
            }]
        );
        assert_eq!(m.up.len(), 1);
        assert_eq!(m.down.len(), 1);
    }

    #[test]
    fn rejects_misplaced_statements() {
        assert!(ScriptMigration::parse("User.create({})\n").is_err());
        assert!(ScriptMigration::parse("transaction do\nend\n").is_err());
        assert!(ScriptMigration::parse("up do\n  bootstrap(null)\nend\n").is_err());
    }

    #[test]
    fn catalog_rejects_duplicates() {
        let mut c = Catalog::new();
        let v = Version::parse("1").unwrap();
        c.register(v.clone(), ScriptMigration::default()).unwrap();
        assert_eq!(
            c.register(v.clone(), ScriptMigration::default()),
            Err(CatalogError::DuplicateVersion { version: v })
        );
        assert_eq!(c.len(), 1);
    }
}
