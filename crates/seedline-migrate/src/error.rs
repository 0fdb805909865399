use seedline_db::Version;
use std::fmt;
use std::path::PathBuf;

/// Dedicated migration failures.
///
/// Returned wrapped in `anyhow::Error`; callers that need to branch on
/// one recover it with `err.downcast_ref::<MigrateError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateError {
    /// The ledger already records this version.
    AlreadyApplied { version: Version },
    /// Revert requested for a version the ledger does not record.
    NotApplied { version: Version },
    /// No migration file matches the requested target.
    MissingMigrationFile { target: String },
    /// There are migration files not yet applied.
    PendingMigrations { versions: Vec<Version> },
    /// Ledger row could not be written and the policy is `fail`.
    LedgerWriteFailure { version: Version, reason: String },
    /// The snapshot artifact could not be written.
    ArtifactWriteFailure { path: PathBuf, reason: String },
    /// A migration file exists but no loader can produce an implementation for it.
    MissingMigration { version: Version, path: PathBuf },
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyApplied { version } => {
                write!(f, "migration {version} has already been applied")
            }
            Self::NotApplied { version } => {
                write!(f, "migration {version} has not been applied")
            }
            Self::MissingMigrationFile { target } => {
                write!(f, "no migration file matches '{target}'")
            }
            Self::PendingMigrations { versions } => {
                let list = versions
                    .iter()
                    .map(Version::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{} pending data migration(s): {list}", versions.len())
            }
            Self::LedgerWriteFailure { version, reason } => {
                write!(f, "could not record migration {version} in the ledger: {reason}")
            }
            Self::ArtifactWriteFailure { path, reason } => {
                write!(f, "could not write artifact {}: {reason}", path.display())
            }
            Self::MissingMigration { version, path } => write!(
                f,
                "no implementation for migration {version} ({})",
                path.display()
            ),
        }
    }
}

impl std::error::Error for MigrateError {}

/// Errors returned by [`Catalog`](crate::Catalog) registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    DuplicateVersion { version: Version },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateVersion { version } => {
                write!(f, "migration {version} is already in the catalog")
            }
        }
    }
}

impl std::error::Error for CatalogError {}
