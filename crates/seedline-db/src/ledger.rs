use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::warn;

use crate::store::{Record, Store};
use crate::version::Version;

/// Table holding one row per applied data migration.
pub const LEDGER_TABLE: &str = "data_migrations";

const LEDGER_SAVEPOINT: &str = "seedline_ledger_write";

/// What to do when the ledger row for a just-applied migration cannot be written.
///
/// `Warn` logs and carries on: the migration's data changes still commit but
/// the version is not recorded, so the migration will run again next time.
/// `Fail` aborts the apply and rolls the data changes back with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerWritePolicy {
    #[default]
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub version: Version,
    pub runtime_seconds: i64,
    pub migrated_on: DateTime<Utc>,
}

impl LedgerEntry {
    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.insert("version".into(), Value::from(self.version.as_str()));
        r.insert("runtime".into(), Value::from(self.runtime_seconds));
        r.insert("migrated_on".into(), Value::from(self.migrated_on.to_rfc3339()));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        let version = match r.get("version") {
            Some(Value::String(s)) => Version::parse(s)?,
            Some(Value::Number(n)) => Version::parse(&n.to_string())?,
            other => bail!("ledger row has invalid version: {:?}", other),
        };
        let runtime_seconds = r.get("runtime").and_then(Value::as_i64).unwrap_or(0);
        let migrated_on = r
            .get("migrated_on")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("ledger row {version} has no migrated_on"))?;
        let migrated_on = DateTime::parse_from_rfc3339(migrated_on)
            .with_context(|| format!("ledger row {version}: bad migrated_on"))?
            .with_timezone(&Utc);
        Ok(Self {
            version,
            runtime_seconds,
            migrated_on,
        })
    }
}

fn version_filter(version: &Version) -> Record {
    let mut f = Record::new();
    f.insert("version".into(), Value::from(version.as_str()));
    f
}

/// Durable record of applied migration versions.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    policy: LedgerWritePolicy,
}

impl Ledger {
    pub fn new(policy: LedgerWritePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> LedgerWritePolicy {
        self.policy
    }

    pub async fn has(&self, store: &mut dyn Store, version: &Version) -> Result<bool> {
        store
            .exists(LEDGER_TABLE, &version_filter(version))
            .await
            .with_context(|| format!("ledger lookup failed for version {version}"))
    }

    /// Record an applied migration, honoring the write policy.
    ///
    /// Returns `Ok(true)` when the row was written and `Ok(false)` when a
    /// write failure was logged and swallowed under [`LedgerWritePolicy::Warn`].
    ///
    /// Under `Warn` this must run inside an open transaction: the insert is
    /// wrapped in a savepoint so a failed write is undone on its own and the
    /// enclosing transaction can still commit.
    pub async fn add(&self, store: &mut dyn Store, entry: &LedgerEntry) -> Result<bool> {
        if self.policy == LedgerWritePolicy::Fail {
            self.insert_strict(store, entry).await?;
            return Ok(true);
        }

        store.savepoint(LEDGER_SAVEPOINT).await?;
        match self.insert_strict(store, entry).await {
            Ok(()) => {
                store.release_savepoint(LEDGER_SAVEPOINT).await?;
                Ok(true)
            }
            Err(e) => {
                store
                    .rollback_to_savepoint(LEDGER_SAVEPOINT)
                    .await
                    .context("ledger savepoint rollback failed")?;
                store.release_savepoint(LEDGER_SAVEPOINT).await?;
                warn!(
                    version = %entry.version,
                    error = %format!("{e:#}"),
                    "ledger write failed; data changes kept without a ledger entry"
                );
                Ok(false)
            }
        }
    }

    /// Record an entry, always propagating failures.
    pub async fn insert_strict(&self, store: &mut dyn Store, entry: &LedgerEntry) -> Result<()> {
        store
            .insert(LEDGER_TABLE, &entry.to_record())
            .await
            .with_context(|| format!("ledger insert failed for version {}", entry.version))
    }

    pub async fn remove(&self, store: &mut dyn Store, version: &Version) -> Result<()> {
        let n = store
            .delete(LEDGER_TABLE, &version_filter(version))
            .await
            .with_context(|| format!("ledger delete failed for version {version}"))?;
        if n == 0 {
            bail!("ledger has no entry for version {version}");
        }
        Ok(())
    }

    /// All entries, ascending by version.
    pub async fn entries(&self, store: &mut dyn Store) -> Result<Vec<LedgerEntry>> {
        let rows = store.rows(LEDGER_TABLE).await.context("read ledger failed")?;
        let mut out = rows
            .iter()
            .map(LedgerEntry::from_record)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }

    pub async fn all_versions(&self, store: &mut dyn Store) -> Result<BTreeSet<Version>> {
        Ok(self
            .entries(store)
            .await?
            .into_iter()
            .map(|e| e.version)
            .collect())
    }

    pub async fn max_version(&self, store: &mut dyn Store) -> Result<Option<Version>> {
        Ok(self.all_versions(store).await?.into_iter().next_back())
    }
}
