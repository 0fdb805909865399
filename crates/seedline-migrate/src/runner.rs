use anyhow::{bail, Context, Result};
use chrono::Utc;
use seedline_artifacts::{parse_script, BlockKind, Statement};
use seedline_config::SeedlineConfig;
use seedline_db::{Ledger, LedgerEntry, LedgerWritePolicy, Store, Version};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::entity::EntityNaming;
use crate::error::MigrateError;
use crate::file::{discover, MigrationFile};
use crate::migration::{Declaration, Migration, MigrationContext, MigrationLoader};
use crate::registry::Registry;
use crate::synthesize::{SynthesisReport, Synthesizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Up,
    Down,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Up => f.pad("up"),
            MigrationState::Down => f.pad("down"),
        }
    }
}

/// Name shown for ledger versions whose file no longer exists.
pub const NO_FILE: &str = "*** NO FILE ***";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub state: MigrationState,
    pub version: Version,
    pub name: String,
}

/// Outcome of `migrate`: what ran, and the synthesis that followed (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOutcome {
    pub applied: Vec<Version>,
    pub synthesis: Option<SynthesisReport>,
}

/// Rebuild the registry from the declarations of applied migrations.
///
/// Pure over its inputs: files are visited in version order and only those
/// whose version is in `applied` contribute, each with its own version as
/// origin.
pub fn replay_registrations(
    files: &[MigrationFile],
    applied: &BTreeSet<Version>,
    loader: &dyn MigrationLoader,
) -> Result<Registry> {
    let mut registry = Registry::new();
    let mut ordered: Vec<&MigrationFile> = files.iter().filter(|f| applied.contains(&f.version)).collect();
    ordered.sort_by(|a, b| a.version.cmp(&b.version));
    for file in ordered {
        let migration = loader.load(file)?;
        for decl in migration.declarations() {
            decl.apply(&mut registry, Some(file.version.clone()));
        }
    }
    Ok(registry)
}

/// Applies and reverts migrations against one store, keeping the ledger and
/// the registry in step.
pub struct Runner<S: Store> {
    store: S,
    registry: Registry,
    ledger: Ledger,
    naming: EntityNaming,
    loader: Arc<dyn MigrationLoader>,
    migrations_dir: PathBuf,
    synthesizer: Synthesizer,
}

impl<S: Store> Runner<S> {
    pub fn new(store: S, loader: Arc<dyn MigrationLoader>, config: &SeedlineConfig) -> Self {
        Self {
            store,
            registry: Registry::new(),
            ledger: Ledger::new(config.ledger_write_policy),
            naming: EntityNaming::from_config(config),
            loader,
            migrations_dir: config.migrations_dir.clone(),
            synthesizer: Synthesizer::from_config(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    /// Create the ledger table if needed.
    pub async fn install(&mut self) -> Result<()> {
        self.store.install().await
    }

    pub fn files(&self) -> Result<Vec<MigrationFile>> {
        discover(&self.migrations_dir)
    }

    pub async fn applied_versions(&mut self) -> Result<BTreeSet<Version>> {
        self.ledger.all_versions(&mut self.store).await
    }

    /// Replace the registry with one rebuilt from applied migrations.
    pub async fn replay(&mut self) -> Result<()> {
        let files = self.files()?;
        let applied = self.applied_versions().await?;
        self.registry = replay_registrations(&files, &applied, self.loader.as_ref())?;
        info!(registrations = self.registry.len(), "registry replayed");
        Ok(())
    }

    fn find_file(&self, target: &str) -> Result<MigrationFile> {
        self.files()?
            .into_iter()
            .find(|f| f.matches(target))
            .ok_or_else(|| {
                MigrateError::MissingMigrationFile {
                    target: target.to_string(),
                }
                .into()
            })
    }

    /// Apply one migration inside a single store transaction.
    pub async fn apply(&mut self, file: &MigrationFile) -> Result<()> {
        let version = file.version.clone();
        if self.ledger.has(&mut self.store, &version).await? {
            return Err(MigrateError::AlreadyApplied { version }.into());
        }
        let migration = self.loader.load(file)?;

        info!("== {} {}: migrating", version, file.name);
        let started = Instant::now();
        let before = self.registry.clone();

        self.store.begin().await?;
        match self.apply_in_tx(migration.as_ref(), &version, started).await {
            Ok(()) => {
                self.store.commit().await?;
                info!(
                    "== {} {}: migrated ({:.4}s)",
                    version,
                    file.name,
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                self.registry = before;
                if let Err(rb) = self.store.rollback().await {
                    error!(version = %version, error = %format!("{rb:#}"), "rollback failed");
                }
                Err(e.context(format!("migration {} {} failed", version, file.name)))
            }
        }
    }

    async fn apply_in_tx(&mut self, migration: &dyn Migration, version: &Version, started: Instant) -> Result<()> {
        for decl in migration.declarations() {
            decl.apply(&mut self.registry, Some(version.clone()));
        }
        {
            let mut cx = MigrationContext::new(
                &mut self.store,
                &mut self.registry,
                &self.naming,
                Some(version.clone()),
            );
            migration.up(&mut cx).await?;
        }

        let entry = LedgerEntry {
            version: version.clone(),
            runtime_seconds: started.elapsed().as_secs() as i64,
            migrated_on: Utc::now(),
        };
        match self.ledger.add(&mut self.store, &entry).await {
            Ok(_) => Ok(()),
            // Warn swallows insert failures; only the savepoint itself can fail here.
            Err(e) => Err(MigrateError::LedgerWriteFailure {
                version: version.clone(),
                reason: format!("{e:#}"),
            }
            .into()),
        }
    }

    /// Revert one applied migration inside a single store transaction.
    pub async fn revert(&mut self, file: &MigrationFile) -> Result<()> {
        let version = file.version.clone();
        if !self.ledger.has(&mut self.store, &version).await? {
            return Err(MigrateError::NotApplied { version }.into());
        }
        let migration = self.loader.load(file)?;

        info!("== {} {}: reverting", version, file.name);
        let started = Instant::now();
        let before = self.registry.clone();

        self.store.begin().await?;
        match self.revert_in_tx(migration.as_ref(), &version).await {
            Ok(()) => {
                self.store.commit().await?;
                info!(
                    "== {} {}: reverted ({:.4}s)",
                    version,
                    file.name,
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                self.registry = before;
                if let Err(rb) = self.store.rollback().await {
                    error!(version = %version, error = %format!("{rb:#}"), "rollback failed");
                }
                Err(e.context(format!("revert of {} {} failed", version, file.name)))
            }
        }
    }

    async fn revert_in_tx(&mut self, migration: &dyn Migration, version: &Version) -> Result<()> {
        {
            let mut cx = MigrationContext::new(
                &mut self.store,
                &mut self.registry,
                &self.naming,
                Some(version.clone()),
            );
            migration.down(&mut cx).await?;
        }
        self.ledger.remove(&mut self.store, version).await?;

        // Registrations this migration declared leave with it.
        for decl in migration.declarations() {
            if let Declaration::Register { entity, .. } = decl {
                let owned = self
                    .registry
                    .get(&entity)
                    .map(|r| r.origin.as_ref() == Some(version))
                    .unwrap_or(false);
                if owned {
                    self.registry.unregister(&entity);
                }
            }
        }
        Ok(())
    }

    /// Files whose version the ledger does not record, ascending.
    pub async fn pending(&mut self) -> Result<Vec<MigrationFile>> {
        let applied = self.applied_versions().await?;
        Ok(self
            .files()?
            .into_iter()
            .filter(|f| !applied.contains(&f.version))
            .collect())
    }

    pub async fn check_pending(&mut self) -> Result<()> {
        let pending = self.pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        Err(MigrateError::PendingMigrations {
            versions: pending.into_iter().map(|f| f.version).collect(),
        }
        .into())
    }

    /// Apply every pending migration in version order; stops at the first failure.
    pub async fn run_pending(&mut self) -> Result<Vec<Version>> {
        let mut applied = Vec::new();
        for file in self.pending().await? {
            self.apply(&file).await?;
            applied.push(file.version);
        }
        Ok(applied)
    }

    /// Run pending migrations, then synthesize once if anything ran.
    pub async fn migrate(&mut self) -> Result<MigrateOutcome> {
        let applied = self.run_pending().await?;
        let synthesis = if applied.is_empty() {
            info!("no pending data migrations");
            None
        } else {
            Some(self.synthesize().await?)
        };
        Ok(MigrateOutcome { applied, synthesis })
    }

    /// Apply the migration matching `target` (version or file name).
    pub async fn run_file(&mut self, target: &str) -> Result<Version> {
        let file = self.find_file(target)?;
        self.apply(&file).await?;
        Ok(file.version)
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    pub async fn rollback(&mut self, steps: usize) -> Result<Vec<Version>> {
        let files = self.files()?;
        let applied = self.applied_versions().await?;
        let mut reverted = Vec::new();
        for version in applied.into_iter().rev().take(steps) {
            let file = files
                .iter()
                .find(|f| f.version == version)
                .cloned()
                .ok_or_else(|| MigrateError::MissingMigrationFile {
                    target: version.to_string(),
                })?;
            self.revert(&file).await?;
            reverted.push(version);
        }
        Ok(reverted)
    }

    pub async fn rollback_file(&mut self, target: &str) -> Result<Version> {
        let file = self.find_file(target)?;
        self.revert(&file).await?;
        Ok(file.version)
    }

    /// Every known version with its state, ascending. Ledger versions with no
    /// file are listed as up with a placeholder name.
    pub async fn status(&mut self) -> Result<Vec<StatusRow>> {
        let applied = self.applied_versions().await?;
        let files = self.files()?;

        let mut rows: Vec<StatusRow> = files
            .iter()
            .map(|f| StatusRow {
                state: if applied.contains(&f.version) {
                    MigrationState::Up
                } else {
                    MigrationState::Down
                },
                version: f.version.clone(),
                name: f.name.clone(),
            })
            .collect();
        for v in &applied {
            if !files.iter().any(|f| &f.version == v) {
                rows.push(StatusRow {
                    state: MigrationState::Up,
                    version: v.clone(),
                    name: NO_FILE.to_string(),
                });
            }
        }
        rows.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(rows)
    }

    /// Record migrations as applied without running them: every file at or
    /// below `cutoff` (all files when `None`). Existing entries are kept.
    /// Returns how many entries were inserted.
    pub async fn bootstrap(&mut self, cutoff: Option<&Version>) -> Result<usize> {
        let files = self.files()?;
        let strict = Ledger::new(LedgerWritePolicy::Fail);

        self.store.begin().await?;
        let res = self.bootstrap_in_tx(&files, cutoff, &strict).await;
        match res {
            Ok(n) => {
                self.store.commit().await?;
                info!(inserted = n, cutoff = ?cutoff.map(Version::as_str), "ledger bootstrapped");
                Ok(n)
            }
            Err(e) => {
                if let Err(rb) = self.store.rollback().await {
                    error!(error = %format!("{rb:#}"), "rollback failed");
                }
                Err(e.context("bootstrap failed"))
            }
        }
    }

    async fn bootstrap_in_tx(
        &mut self,
        files: &[MigrationFile],
        cutoff: Option<&Version>,
        ledger: &Ledger,
    ) -> Result<usize> {
        let mut inserted = 0;
        for f in files {
            if cutoff.map(|c| &f.version > c).unwrap_or(false) {
                continue;
            }
            if ledger.has(&mut self.store, &f.version).await? {
                continue;
            }
            let entry = LedgerEntry {
                version: f.version.clone(),
                runtime_seconds: 0,
                migrated_on: Utc::now(),
            };
            ledger.insert_strict(&mut self.store, &entry).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Replay an artifact: its `transaction` block in one store transaction,
    /// then a ledger bootstrap to the version it records.
    pub async fn seed(&mut self, text: &str) -> Result<SeedOutcome> {
        let script = parse_script(text).context("parse artifact")?;
        let Some(tx) = script.block(BlockKind::Transaction) else {
            bail!("artifact has no `transaction do` block");
        };
        let version = script.top_level.iter().find_map(|s| match &s.stmt {
            Statement::Bootstrap { version } => Some(version.clone()),
            _ => None,
        });

        self.store.begin().await?;
        let res = {
            let mut cx = MigrationContext::new(&mut self.store, &mut self.registry, &self.naming, None);
            let mut out = Ok(());
            for s in &tx.body {
                if let Err(e) = cx.execute(s).await {
                    out = Err(e);
                    break;
                }
            }
            out
        };
        match res {
            Ok(()) => self.store.commit().await?,
            Err(e) => {
                if let Err(rb) = self.store.rollback().await {
                    error!(error = %format!("{rb:#}"), "rollback failed");
                }
                return Err(e.context("seed failed"));
            }
        }

        let bootstrapped = match version.flatten() {
            Some(v) => {
                let n = self.bootstrap(Some(&v)).await?;
                Some((v, n))
            }
            None => None,
        };
        info!(statements = tx.body.len(), "artifact replayed");
        Ok(SeedOutcome {
            statements: tx.body.len(),
            bootstrapped,
        })
    }

    /// Regenerate the artifact (no-op outside the designated environment).
    pub async fn synthesize(&mut self) -> Result<SynthesisReport> {
        let files = self.files()?;
        self.synthesizer
            .synthesize(&mut self.store, &self.registry, &files)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedOutcome {
    /// Statements executed from the transaction block.
    pub statements: usize,
    /// Version bootstrapped to and how many ledger entries that inserted.
    pub bootstrapped: Option<(Version, usize)>,
}
