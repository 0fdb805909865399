//! Config layering, defaults and the artifact environment gate.
//!
//! GREEN when:
//! - An empty layer set yields every documented default.
//! - Later layers override earlier ones key by key (deep merge).
//! - Reordering keys within YAML doesn't change the config hash.
//! - `artifact_enabled()` is true only when the toggle is on AND the current
//!   environment equals the designated one.
//! - Unknown keys are reported; Fail policy turns them into an error.

use seedline_config::{load_layered_yaml_from_strings, report_unused_keys, UnusedKeyPolicy};
use seedline_db::LedgerWritePolicy;
use std::path::PathBuf;

const BASE: &str = r#"
artifact_path: "db/seeds.seed"
environment: "development"
log:
  level: "debug"
entity_names:
  people: "Person"
"#;

const BASE_REORDERED: &str = r#"
entity_names:
  people: "Person"
log:
  level: "debug"
environment: "development"
artifact_path: "db/seeds.seed"
"#;

const PROD: &str = r#"
environment: "production"
ledger_write_policy: "fail"
"#;

#[test]
fn empty_layers_give_defaults() {
    let loaded = load_layered_yaml_from_strings(&[]).unwrap();
    let c = loaded.config;
    assert_eq!(c.artifact_path, PathBuf::from("db/seeds.seed"));
    assert_eq!(c.migrations_dir, PathBuf::from("db/data_migrations"));
    assert!(c.update_artifact);
    assert!(!c.ignore_ids);
    assert!(!c.strict_create);
    assert_eq!(c.ledger_write_policy, LedgerWritePolicy::Warn);
    assert!(c.replay_registrations);
    assert_eq!(c.log.level, "info");
    assert!(c.artifact_enabled());
}

#[test]
fn later_layer_overrides_and_closes_gate() {
    let loaded = load_layered_yaml_from_strings(&[BASE, PROD]).unwrap();
    let c = &loaded.config;
    assert_eq!(c.environment, "production");
    assert_eq!(c.ledger_write_policy, LedgerWritePolicy::Fail);
    // untouched keys from the base survive the merge
    assert_eq!(c.log.level, "debug");
    assert_eq!(c.entity_names.get("people").map(String::as_str), Some("Person"));
    assert!(!c.artifact_enabled());
}

#[test]
fn disabled_toggle_closes_gate_in_designated_env() {
    let loaded = load_layered_yaml_from_strings(&["update_artifact: false"]).unwrap();
    assert_eq!(loaded.config.environment, loaded.config.artifact_environment);
    assert!(!loaded.config.artifact_enabled());
}

#[test]
fn hash_ignores_key_order() {
    let a = load_layered_yaml_from_strings(&[BASE]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_REORDERED]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);

    let c = load_layered_yaml_from_strings(&[BASE, PROD]).unwrap();
    assert_ne!(a.config_hash, c.config_hash);
    assert_eq!(a.config_hash.len(), 64);
}

#[test]
fn unknown_keys_warn_or_fail() {
    let loaded =
        load_layered_yaml_from_strings(&[BASE, "artifcat_path: \"typo.seed\"\n"]).unwrap();

    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(report.unused_leaf_pointers, vec!["/artifcat_path".to_string()]);

    let err = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail).unwrap_err();
    assert!(format!("{err}").contains("CONFIG_UNUSED_KEYS"));

    let clean = load_layered_yaml_from_strings(&[BASE]).unwrap();
    assert!(report_unused_keys(&clean.config_json, UnusedKeyPolicy::Fail)
        .unwrap()
        .is_clean());
}
