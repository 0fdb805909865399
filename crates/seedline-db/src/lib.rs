//! Persistence layer for seedline.
//!
//! Everything above this crate talks to the database through the [`Store`]
//! trait. Two implementations ship here: [`PgStore`] (Postgres via sqlx) and
//! [`MemoryStore`] (in-process, used by tests and embedding callers).
//! The migration [`Ledger`] is built on top of the same trait.

use anyhow::{Context, Result};

mod ledger;
mod memory;
mod pg;
mod store;
mod version;

pub use ledger::{Ledger, LedgerEntry, LedgerWritePolicy, LEDGER_TABLE};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{compare_values, Record, Store};
pub use version::Version;

pub const ENV_DB_URL: &str = "SEEDLINE_DATABASE_URL";

/// Tables owned by tooling rather than by the application.
/// These never show up as entity types in a snapshot.
pub const FRAMEWORK_TABLES: &[&str] = &["_sqlx_migrations"];

/// Connect to Postgres using SEEDLINE_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgStore> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    PgStore::connect(&url).await
}

/// True for the ledger's own table and framework-internal tables.
pub fn is_internal_table(name: &str) -> bool {
    name == LEDGER_TABLE || FRAMEWORK_TABLES.contains(&name)
}
