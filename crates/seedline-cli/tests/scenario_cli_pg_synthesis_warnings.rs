//! `seedline migrate` against Postgres prints each synthesis warning once.
//!
//! DB-backed test, skipped if SEEDLINE_DATABASE_URL is not set.
//!
//! GREEN when:
//! - a migration that writes to a table no migration registers is applied,
//!   the artifact is regenerated, and stderr carries the UnregisteredData
//!   warning exactly once

use assert_cmd::prelude::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fs;
use std::process::Command;

const VERSION: &str = "19700101000043";

async fn cleanup(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("drop table if exists seedline_cli_notes")
        .execute(pool)
        .await?;
    sqlx::query("delete from data_migrations where version = $1")
        .bind(VERSION)
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn migrate_logs_unregistered_data_warning_once() -> anyhow::Result<()> {
    let url = match std::env::var(seedline_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SEEDLINE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let mut store = seedline_db::PgStore::connect(&url).await?;
    seedline_db::Store::install(&mut store).await?;
    drop(store);

    let pool = PgPoolOptions::new().max_connections(1).connect(&url).await?;
    cleanup(&pool).await?;
    sqlx::query("create table seedline_cli_notes (id bigserial primary key, body text)")
        .execute(&pool)
        .await?;

    let dir = tempfile::tempdir()?;
    let migrations = dir.path().join("data_migrations");
    fs::create_dir_all(&migrations)?;
    fs::write(
        migrations.join(format!("{VERSION}_add_note.seed")),
        "up do\n  SeedlineCliNote.create({\"body\":\"hi\"})\nend\ndown do\nend\n",
    )?;
    fs::write(
        dir.path().join("seedline.yaml"),
        format!(
            "migrations_dir: \"{}\"\nartifact_path: \"{}\"\n",
            migrations.display(),
            dir.path().join("seeds.seed").display()
        ),
    )?;

    #[allow(deprecated)]
    let out = Command::cargo_bin("seedline")?
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("SEEDLINE_ENV")
        .env(seedline_db::ENV_DB_URL, &url)
        .arg("migrate")
        .output()?;
    cleanup(&pool).await?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(out.status.success(), "stderr:\n{stderr}");
    assert!(stdout.contains(&format!("applied={VERSION}")), "stdout:\n{stdout}");
    assert!(stdout.contains("artifact_written=true"), "stdout:\n{stdout}");
    assert_eq!(
        stderr.matches("unregistered entity types hold data").count(),
        1,
        "stderr:\n{stderr}"
    );
    Ok(())
}
