//! Artifact regeneration only happens in the designated environment.
//!
//! GREEN when:
//! - outside the designated environment, migrate still applies pending
//!   migrations but touches no artifact file (not even its directory)
//! - with update_artifact off, the same holds in the designated environment
//! - a pre-existing artifact is left untouched by a gated run

use seedline_config::SeedlineConfig;
use seedline_db::MemoryStore;
use seedline_migrate::{Runner, ScriptLoader};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn config(root: &Path) -> SeedlineConfig {
    SeedlineConfig {
        artifact_path: root.join("out").join("seeds.seed"),
        migrations_dir: root.join("db").join("data_migrations"),
        ..SeedlineConfig::default()
    }
}

fn write_migration(cfg: &SeedlineConfig, file: &str, body: &str) {
    fs::create_dir_all(&cfg.migrations_dir).unwrap();
    fs::write(cfg.migrations_dir.join(file), body).unwrap();
}

const BODY: &str = "register Tag\nup do\n  Tag.create({\"name\":\"t\"})\nend\ndown do\nend\n";

fn store() -> MemoryStore {
    MemoryStore::new().with_table("tags", &["id", "name"], Some("id"))
}

#[tokio::test]
async fn other_environment_writes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = SeedlineConfig {
        environment: "production".into(),
        ..config(dir.path())
    };
    write_migration(&cfg, "1_tags.seed", BODY);

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    let out = r.migrate().await?;

    assert_eq!(out.applied.len(), 1);
    assert_eq!(r.store().row_count("tags"), 1);
    let report = out.synthesis.expect("synthesis attempted");
    assert!(!report.written);
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[tokio::test]
async fn disabled_toggle_writes_nothing_and_keeps_old_artifact() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = SeedlineConfig {
        update_artifact: false,
        ..config(dir.path())
    };
    write_migration(&cfg, "1_tags.seed", BODY);
    fs::create_dir_all(dir.path().join("out"))?;
    fs::write(&cfg.artifact_path, "hand written\n")?;

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    r.migrate().await?;
    r.synthesize().await?;

    assert_eq!(fs::read_to_string(&cfg.artifact_path)?, "hand written\n");
    assert_eq!(fs::read_dir(dir.path().join("out"))?.count(), 1);
    Ok(())
}
