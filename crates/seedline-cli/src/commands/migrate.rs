//! Ledger-backed commands. Each opens its own Postgres connection.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use seedline_artifacts::read_optional;
use seedline_config::SeedlineConfig;
use seedline_db::{PgStore, Version};
use seedline_migrate::{new_migration_file, Runner, ScriptLoader, SynthesisReport};
use std::sync::Arc;

async fn open_runner(config: &SeedlineConfig) -> Result<Runner<PgStore>> {
    let store = seedline_db::connect_from_env().await?;
    let mut runner = Runner::new(store, Arc::new(ScriptLoader), config);
    runner.install().await?;
    if config.replay_registrations {
        runner.replay().await?;
    }
    Ok(runner)
}

/// Warnings are not repeated here; synthesis already logged each one.
fn print_report(report: &SynthesisReport) {
    println!(
        "artifact_written={} path={}",
        report.written,
        report.path.display()
    );
    if !report.written {
        return;
    }
    for s in &report.sections {
        println!(
            "section entity={} table={} records={} fields={}",
            s.entity,
            s.table,
            s.records,
            s.fields.join(",")
        );
    }
    println!(
        "bootstrap={}",
        report.max_version.as_ref().map(Version::as_str).unwrap_or("null")
    );
}

async fn synthesize_after(runner: &mut Runner<PgStore>) -> Result<()> {
    let report = runner.synthesize().await?;
    print_report(&report);
    Ok(())
}

pub fn new_file(config: &SeedlineConfig, name: &str) -> Result<()> {
    let path = new_migration_file(&config.migrations_dir, name, Utc::now())?;
    println!("created={}", path.display());
    Ok(())
}

pub async fn migrate(config: &SeedlineConfig) -> Result<()> {
    let mut runner = open_runner(config).await?;
    let outcome = runner.migrate().await?;
    for v in &outcome.applied {
        println!("applied={v}");
    }
    match &outcome.synthesis {
        Some(report) => print_report(report),
        None => println!("pending=0"),
    }
    Ok(())
}

pub async fn run_one(config: &SeedlineConfig, target: &str) -> Result<()> {
    let mut runner = open_runner(config).await?;
    let v = runner.run_file(target).await?;
    println!("applied={v}");
    synthesize_after(&mut runner).await
}

pub async fn rollback(config: &SeedlineConfig, steps: usize, file: Option<&str>) -> Result<()> {
    let mut runner = open_runner(config).await?;
    let reverted = match file {
        Some(target) => vec![runner.rollback_file(target).await?],
        None => runner.rollback(steps).await?,
    };
    if reverted.is_empty() {
        println!("reverted=0");
        return Ok(());
    }
    for v in &reverted {
        println!("reverted={v}");
    }
    synthesize_after(&mut runner).await
}

pub async fn status(config: &SeedlineConfig) -> Result<()> {
    let mut runner = open_runner(config).await?;
    let rows = runner.status().await?;
    println!(" Status   Migration ID    Migration Name");
    println!("--------------------------------------------------");
    for row in rows {
        println!("{:>6}    {:<14}  {}", row.state, row.version.as_str(), row.name);
    }
    Ok(())
}

pub async fn check(config: &SeedlineConfig) -> Result<()> {
    let mut runner = open_runner(config).await?;
    runner.check_pending().await?;
    println!("pending=0");
    Ok(())
}

pub async fn bootstrap(config: &SeedlineConfig, cutoff: Option<&str>) -> Result<()> {
    let cutoff = cutoff.map(Version::parse).transpose()?;
    let mut runner = open_runner(config).await?;
    let n = runner.bootstrap(cutoff.as_ref()).await?;
    println!("bootstrapped={n}");
    if n > 0 {
        synthesize_after(&mut runner).await?;
    }
    Ok(())
}

pub async fn seed(config: &SeedlineConfig) -> Result<()> {
    let path = &config.artifact_path;
    let Some(text) = read_optional(path)? else {
        bail!("no artifact at {}", path.display());
    };
    let mut runner = open_runner(config).await?;
    let outcome = runner
        .seed(&text)
        .await
        .with_context(|| format!("seed from {}", path.display()))?;
    println!("statements={}", outcome.statements);
    if let Some((v, n)) = &outcome.bootstrapped {
        println!("bootstrapped={n} version={v}");
    }
    synthesize_after(&mut runner).await
}

pub async fn synthesize(config: &SeedlineConfig) -> Result<()> {
    let mut runner = open_runner(config).await?;
    synthesize_after(&mut runner).await
}
