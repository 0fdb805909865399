//! Seed script grammar and snapshot artifact I/O.

mod canonical;
mod index;
mod render;
mod script;
mod write;

pub use canonical::{canonical_json, canonical_record};
pub use index::ArtifactIndex;
pub use render::{bootstrap_line, create_line, render_artifact, Section, ARTIFACT_HEADER};
pub use script::{parse_line, parse_script, BlockKind, Script, ScriptBlock, Spanned, Statement};
pub use write::{read_optional, write_atomic};
