//! Data migrations and snapshot synthesis.
//!
//! [`Runner`] applies/reverts migrations and keeps the ledger and the
//! [`Registry`] in step. [`Synthesizer`] regenerates the snapshot artifact
//! after each batch, recovering what the process-lifetime registry forgot
//! from the previous artifact and from the source of applied migrations.

mod entity;
mod error;
mod file;
mod migration;
mod origin;
mod registry;
mod runner;
mod synthesize;

pub use entity::{derive_entity_name, entity_tables, EntityNaming, EntityTable};
pub use error::{CatalogError, MigrateError};
pub use file::{discover, humanize, new_migration_file, MigrationFile, SCRIPT_EXTENSION};
pub use migration::{
    record, Catalog, Declaration, Migration, MigrationContext, MigrationLoader, ScriptLoader,
    ScriptMigration,
};
pub use origin::{ArtifactFieldRecovery, NoRecovery, RecoveryStrategy, SourceScanOrigin};
pub use registry::{Registration, Registry};
pub use runner::{
    replay_registrations, MigrateOutcome, MigrationState, Runner, SeedOutcome, StatusRow, NO_FILE,
};
pub use synthesize::{SectionSummary, Synthesis, SynthesisReport, SynthesisWarning, Synthesizer};
