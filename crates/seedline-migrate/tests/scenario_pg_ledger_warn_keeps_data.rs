//! Warn-policy ledger failures against a real Postgres.
//!
//! DB-backed test, skipped if SEEDLINE_DATABASE_URL is not set.
//!
//! GREEN when:
//! - a ledger insert rejected by the database (here: a BEFORE INSERT trigger
//!   on data_migrations) does not abort the migration's transaction
//! - `run_pending` returns the version, the migration's row is committed,
//!   and no ledger entry exists for it

use seedline_config::SeedlineConfig;
use seedline_db::{LedgerWritePolicy, PgStore};
use seedline_migrate::{Runner, ScriptLoader};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fs;
use std::sync::Arc;

const VERSION: &str = "19700101000042";

async fn exec(pool: &PgPool, sql: &str) -> anyhow::Result<()> {
    sqlx::query(sql).execute(pool).await?;
    Ok(())
}

async fn cleanup(pool: &PgPool) -> anyhow::Result<()> {
    exec(pool, "drop trigger if exists seedline_reject_ledger_row on data_migrations").await?;
    exec(pool, "drop function if exists seedline_reject_ledger_row()").await?;
    exec(pool, "drop table if exists seedline_warn_users").await?;
    sqlx::query("delete from data_migrations where version = $1")
        .bind(VERSION)
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn pg_rejected_ledger_write_keeps_committed_data() -> anyhow::Result<()> {
    let url = match std::env::var(seedline_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SEEDLINE_DATABASE_URL not set");
            return Ok(());
        }
    };

    let dir = tempfile::tempdir()?;
    let cfg = SeedlineConfig {
        artifact_path: dir.path().join("seeds.seed"),
        migrations_dir: dir.path().join("data_migrations"),
        ..SeedlineConfig::default()
    };
    assert_eq!(cfg.ledger_write_policy, LedgerWritePolicy::Warn);
    fs::create_dir_all(&cfg.migrations_dir)?;
    fs::write(
        cfg.migrations_dir.join(format!("{VERSION}_add_bob.seed")),
        "register SeedlineWarnUser\nup do\n  SeedlineWarnUser.create({\"username\":\"bob\"})\nend\ndown do\nend\n",
    )?;

    let store = PgStore::connect(&url).await?;
    let mut r = Runner::new(store, Arc::new(ScriptLoader), &cfg);
    r.install().await?;

    let pool = PgPoolOptions::new().max_connections(1).connect(&url).await?;
    cleanup(&pool).await?;
    exec(
        &pool,
        "create table seedline_warn_users (id bigserial primary key, username text not null)",
    )
    .await?;
    exec(
        &pool,
        r#"
        create function seedline_reject_ledger_row() returns trigger
        language plpgsql as $$
        begin
            if new.version = '19700101000042' then
                raise exception 'ledger write rejected';
            end if;
            return new;
        end
        $$
        "#,
    )
    .await?;
    exec(
        &pool,
        "create trigger seedline_reject_ledger_row before insert on data_migrations \
         for each row execute function seedline_reject_ledger_row()",
    )
    .await?;

    let applied = r.run_pending().await;

    let (users,): (i64,) = sqlx::query_as("select count(*) from seedline_warn_users where username = 'bob'")
        .fetch_one(&pool)
        .await?;
    let (ledger,): (i64,) = sqlx::query_as("select count(*) from data_migrations where version = $1")
        .bind(VERSION)
        .fetch_one(&pool)
        .await?;
    drop(r);
    cleanup(&pool).await?;

    let applied: Vec<String> = applied?.into_iter().map(String::from).collect();
    assert_eq!(applied, vec![VERSION.to_string()]);
    assert_eq!(users, 1, "migration data must survive the rejected ledger write");
    assert_eq!(ledger, 0);
    Ok(())
}
