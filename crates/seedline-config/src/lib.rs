use anyhow::{bail, Context, Result};
use seedline_db::LedgerWritePolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

/// Env var that overrides `environment` from the YAML layers.
pub const ENV_ENVIRONMENT: &str = "SEEDLINE_ENV";

/// Default config file picked up by the CLI when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "seedline.yaml";

/// Effective configuration after layering and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedlineConfig {
    /// Snapshot artifact regenerated after every migration batch.
    pub artifact_path: PathBuf,
    /// Directory holding `<version>_<name>.<ext>` migration files.
    pub migrations_dir: PathBuf,
    pub update_artifact: bool,
    /// Drop primary keys from created records and skip sequence resets.
    pub ignore_ids: bool,
    /// Emit `create!` lines instead of `create`.
    pub strict_create: bool,
    /// Environment this process runs in.
    pub environment: String,
    /// The only environment in which the artifact is regenerated.
    pub artifact_environment: String,
    /// Tables never snapshotted, on top of the ledger and framework tables.
    pub excluded_tables: Vec<String>,
    /// table -> entity type name overrides.
    pub entity_names: BTreeMap<String, String>,
    pub ledger_write_policy: LedgerWritePolicy,
    /// Rebuild declared registrations of applied migrations at startup.
    pub replay_registrations: bool,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// tracing filter directive; "off" silences everything.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for SeedlineConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("db/seeds.seed"),
            migrations_dir: PathBuf::from("db/data_migrations"),
            update_artifact: true,
            ignore_ids: false,
            strict_create: false,
            environment: "development".to_string(),
            artifact_environment: "development".to_string(),
            excluded_tables: Vec::new(),
            entity_names: BTreeMap::new(),
            ledger_write_policy: LedgerWritePolicy::Warn,
            replay_registrations: true,
            log: LogConfig::default(),
        }
    }
}

impl SeedlineConfig {
    /// Artifact regeneration fires only when enabled AND running in the
    /// designated environment.
    pub fn artifact_enabled(&self) -> bool {
        self.update_artifact && self.environment == self.artifact_environment
    }

    /// Apply `SEEDLINE_ENV` (when set and non-empty) over `environment`.
    pub fn with_environment_override(mut self, env_value: Option<String>) -> Self {
        if let Some(env) = env_value.map(|s| s.trim().to_string()) {
            if !env.is_empty() {
                self.environment = env;
            }
        }
        self
    }

    pub fn with_environment_from_env(self) -> Self {
        let v = std::env::var(ENV_ENVIRONMENT).ok();
        self.with_environment_override(v)
    }
}

/// Keys the loader understands. Anything else in the YAML is reported as unused.
const KNOWN_POINTERS: &[&str] = &[
    "/artifact_path",
    "/migrations_dir",
    "/update_artifact",
    "/ignore_ids",
    "/strict_create",
    "/environment",
    "/artifact_environment",
    "/excluded_tables",
    "/entity_names",
    "/ledger_write_policy",
    "/replay_registrations",
    "/log/level",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    /// Minimal set of unused leaf pointers (sorted)
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Report config leaves no setting reads (typos, stale keys).
/// If `policy == Fail`, returns an error when unused keys exist.
pub fn report_unused_keys(config_json: &Value, policy: UnusedKeyPolicy) -> Result<UnusedKeyReport> {
    let known: BTreeSet<&str> = KNOWN_POINTERS.iter().copied().collect();

    let mut leaves: Vec<String> = Vec::new();
    collect_leaf_pointers(config_json, "", &mut leaves);

    let mut unused: Vec<String> = leaves
        .into_iter()
        .filter(|lp| lp != "/" && !known.iter().any(|k| is_prefix_pointer(k, lp)))
        .collect();
    unused.sort();
    unused.dedup();

    let report = UnusedKeyReport {
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        bail!(
            "CONFIG_UNUSED_KEYS: {} unused config leaf key(s) detected. First few: {}",
            report.unused_leaf_pointers.len(),
            preview_list(&report.unused_leaf_pointers, 12)
        );
    }

    Ok(report)
}

/// Return true if `prefix` is a JSON-pointer prefix of `leaf`.
///
/// - exact match consumes
/// - "/a/b" consumes "/a/b/c" but NOT "/a/bc"
fn is_prefix_pointer(prefix: &str, leaf: &str) -> bool {
    if leaf == prefix {
        return true;
    }
    leaf.starts_with(prefix)
        && leaf
            .get(prefix.len()..prefix.len() + 1)
            .map(|c| c == "/")
            .unwrap_or(false)
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) if !map.is_empty() => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) if !arr.is_empty() => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn preview_list(items: &[String], n: usize) -> String {
    let take = items.iter().take(n).cloned().collect::<Vec<_>>();
    format!("{:?}", take)
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
    pub config: SeedlineConfig,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    // Merge YAML docs in order: earlier docs are base, later docs override.
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        // An empty document parses as null; treat it as "no overrides".
        if v_json.is_null() {
            continue;
        }
        merged = deep_merge(merged, v_json);
    }

    let config: SeedlineConfig =
        serde_json::from_value(merged.clone()).context("invalid seedline config")?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
        config,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// Compact JSON with object keys sorted at every depth.
fn canonicalize_json(v: &Value) -> Result<String> {
    fn sorted(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, vv)| (k, sorted(vv))).collect();
                Value::Object(ordered.into_iter().map(|(k, vv)| (k.clone(), vv)).collect())
            }
            Value::Array(arr) => Value::Array(arr.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sorted(v)).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
