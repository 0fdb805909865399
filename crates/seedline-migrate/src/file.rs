use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use seedline_db::Version;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Extension used for script migrations and generated artifacts.
pub const SCRIPT_EXTENSION: &str = "seed";

/// A migration on disk: `<version>_<snake_name>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: Version,
    /// Humanized name, `add_admin_users` -> `AddAdminUsers`.
    pub name: String,
    pub path: PathBuf,
}

impl MigrationFile {
    /// `None` when the file name does not follow the naming scheme.
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        if ext.is_empty() {
            return None;
        }
        let (digits, snake) = stem.split_once('_')?;
        if snake.is_empty() || !snake.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        let version = Version::parse(digits).ok()?;
        Some(Self {
            version,
            name: humanize(snake),
            path: path.to_path_buf(),
        })
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }

    /// Match a CLI target: a version, a file name, or a file name without extension.
    pub fn matches(&self, target: &str) -> bool {
        let target = target.trim();
        let name = self.file_name();
        target == self.version.as_str()
            || target == name
            || name.rsplit_once('.').map(|(stem, _)| stem == target).unwrap_or(false)
    }
}

/// `add_admin_users` -> `AddAdminUsers`.
pub fn humanize(snake: &str) -> String {
    snake
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// All migration files in `dir`, ascending by version.
///
/// A missing directory means no migrations. Files that do not follow the
/// naming scheme are ignored. Two files sharing a version is an error.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.with_context(|| format!("read_dir entry in {:?}", dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(file) = MigrationFile::from_path(&path) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));

    for pair in files.windows(2) {
        if pair[0].version == pair[1].version {
            bail!(
                "duplicate migration version {}: {} and {}",
                pair[0].version,
                pair[0].file_name(),
                pair[1].file_name()
            );
        }
    }
    Ok(files)
}

fn normalize_name(name: &str) -> Result<String> {
    let mut out = String::new();
    let mut prev_lower = false;
    for c in name.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c == '-' || c == ' ' || c == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_lower = true;
        } else {
            bail!("invalid character {c:?} in migration name '{name}'");
        }
    }
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() {
        bail!("migration name must not be empty");
    }
    Ok(out)
}

/// Scaffold `<YYYYMMDDHHMMSS>_<name>.seed` in `dir` with empty blocks.
///
/// Accepts `snake_case`, `kebab-case` or `CamelCase` names. Never overwrites.
pub fn new_migration_file(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let snake = normalize_name(name)?;
    let version = now.format("%Y%m%d%H%M%S").to_string();

    fs::create_dir_all(dir).with_context(|| format!("create_dir_all {:?}", dir))?;
    if let Some(clash) = discover(dir)?
        .into_iter()
        .find(|f| f.version.as_str() == version)
    {
        bail!("a migration with version {version} already exists: {}", clash.file_name());
    }

    let path = dir.join(format!("{version}_{snake}.{SCRIPT_EXTENSION}"));
    let body = format!(
        "# {} data migration.\n\
         # `register Entity [exclude field, ...]` lines placed above the blocks\n\
         # are replayed on every run.\n\
         \n\
         up do\n\
         end\n\
         \n\
         down do\n\
         end\n",
        humanize(&snake)
    );

    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("create migration file {:?}", path))?;
    f.write_all(body.as_bytes())
        .with_context(|| format!("write migration file {:?}", path))?;
    Ok(path)
}
