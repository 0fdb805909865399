//! All-or-nothing apply, and the ledger write policy.
//!
//! GREEN when:
//! - a failing `up` leaves no rows, no ledger entry, no open transaction and
//!   no registration behind
//! - under the Warn policy a failed ledger write keeps the data and leaves
//!   the migration pending; the failed insert must not poison the
//!   transaction the data was written in
//! - under the Fail policy it surfaces LedgerWriteFailure and rolls the data
//!   back with it
//! - non-strict create skips an existing key; strict create fails on it

use seedline_config::SeedlineConfig;
use seedline_db::{LedgerWritePolicy, MemoryStore, LEDGER_TABLE};
use seedline_migrate::{MigrateError, Runner, ScriptLoader};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn config(root: &Path) -> SeedlineConfig {
    SeedlineConfig {
        artifact_path: root.join("db").join("seeds.seed"),
        migrations_dir: root.join("db").join("data_migrations"),
        ..SeedlineConfig::default()
    }
}

fn write_migration(cfg: &SeedlineConfig, file: &str, body: &str) {
    fs::create_dir_all(&cfg.migrations_dir).unwrap();
    fs::write(cfg.migrations_dir.join(file), body).unwrap();
}

fn store() -> MemoryStore {
    MemoryStore::new().with_table("users", &["id", "username"], Some("id"))
}

const ADD_BOB: &str = "register User\nup do\n  User.create({\"username\":\"bob\"})\nend\ndown do\nend\n";

#[tokio::test]
async fn failing_up_leaves_nothing_behind() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    write_migration(
        &cfg,
        "1_broken.seed",
        "register User\nup do\n  User.create({\"username\":\"bob\"})\n  Ghost.create({\"name\":\"x\"})\nend\ndown do\nend\n",
    );

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    let err = r.run_pending().await.unwrap_err();
    assert!(format!("{err:#}").contains("Ghost"), "got: {err:#}");

    assert_eq!(r.store().row_count("users"), 0);
    assert_eq!(r.store().row_count(LEDGER_TABLE), 0);
    assert!(!r.store().in_transaction());
    assert!(r.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn warn_policy_keeps_data_without_ledger_entry() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    assert_eq!(cfg.ledger_write_policy, LedgerWritePolicy::Warn);
    write_migration(&cfg, "1_add_bob.seed", ADD_BOB);

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    r.store_mut().reject_writes_to(LEDGER_TABLE);

    let applied = r.run_pending().await?;
    assert_eq!(applied.len(), 1);
    assert_eq!(r.store().row_count("users"), 1);
    assert_eq!(r.store().row_count(LEDGER_TABLE), 0);
    assert!(!r.store().in_transaction());

    r.store_mut().allow_writes_to(LEDGER_TABLE);
    assert_eq!(r.pending().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn fail_policy_rolls_back_with_ledger_write_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = SeedlineConfig {
        ledger_write_policy: LedgerWritePolicy::Fail,
        ..config(dir.path())
    };
    write_migration(&cfg, "1_add_bob.seed", ADD_BOB);

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    r.store_mut().reject_writes_to(LEDGER_TABLE);

    let err = r.run_pending().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MigrateError>(),
        Some(MigrateError::LedgerWriteFailure { .. })
    ));
    assert_eq!(r.store().row_count("users"), 0);
    assert!(r.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn strict_and_lenient_create_on_existing_key() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(dir.path());
    write_migration(
        &cfg,
        "1_seed_bob.seed",
        "up do\n  User.create({\"id\":1,\"username\":\"bob\"})\nend\ndown do\nend\n",
    );
    write_migration(
        &cfg,
        "2_seed_bob_again.seed",
        "up do\n  User.create({\"id\":1,\"username\":\"robert\"})\nend\ndown do\nend\n",
    );
    write_migration(
        &cfg,
        "3_seed_bob_strict.seed",
        "up do\n  User.create!({\"id\":1,\"username\":\"bobby\"})\nend\ndown do\nend\n",
    );

    let mut r = Runner::new(store(), Arc::new(ScriptLoader), &cfg);
    r.install().await?;
    r.run_file("1").await?;
    r.run_file("2").await?;
    assert_eq!(r.store().row_count("users"), 1);

    let err = r.run_file("3").await.unwrap_err();
    assert!(format!("{err:#}").contains("already exists"), "got: {err:#}");
    assert_eq!(r.pending().await?.len(), 1);
    Ok(())
}
