use anyhow::{Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use crate::store::{Record, Store};

/// Postgres-backed [`Store`].
///
/// Statements run on one connection checked out of the pool, so that
/// `begin`/`commit`/`rollback` bracket every statement issued in between.
/// The pool itself only serves the embedded migrator.
///
/// Rows travel as JSON: reads use `row_to_json`, writes use
/// `jsonb_populate_record`, so no per-column type mapping is needed on this
/// side.
pub struct PgStore {
    pool: PgPool,
    conn: PoolConnection<Postgres>,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        let conn = pool
            .acquire()
            .await
            .context("failed to acquire Postgres connection")?;
        Ok(Self { pool, conn })
    }

    async fn exec(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("{sql} failed"))?;
        Ok(())
    }
}

/// Quote an identifier for interpolation into SQL text.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn filter_json(filter: &Record) -> Result<String> {
    serde_json::to_string(filter).context("serialize row filter failed")
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn install(&mut self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("ledger schema migrate failed")?;
        Ok(())
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            select table_name::text
            from information_schema.tables
            where table_schema = current_schema()
              and table_type = 'BASE TABLE'
            order by table_name
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await
        .context("list tables failed")?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            select column_name::text
            from information_schema.columns
            where table_schema = current_schema()
              and table_name = $1
            order by ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("list columns failed: {table}"))?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    async fn primary_key(&mut self, table: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            select a.attname::text
            from pg_index i
            join pg_attribute a
              on a.attrelid = i.indrelid
             and a.attnum = any(i.indkey)
            where i.indrelid = $1::regclass
              and i.indisprimary
            order by array_position(i.indkey::int2[], a.attnum)
            limit 1
            "#,
        )
        .bind(quote_ident(table))
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("primary key lookup failed: {table}"))?;
        Ok(row.map(|(c,)| c))
    }

    async fn has_rows(&mut self, table: &str) -> Result<bool> {
        let sql = format!("select exists (select 1 from {})", quote_ident(table));
        let (exists,): (bool,) = sqlx::query_as(&sql)
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("has_rows failed: {table}"))?;
        Ok(exists)
    }

    async fn rows(&mut self, table: &str) -> Result<Vec<Record>> {
        let order = match self.primary_key(table).await? {
            Some(pk) => format!("t.{} asc", quote_ident(&pk)),
            // No key: fall back to a content order so output stays deterministic.
            None => "row_to_json(t)::text asc".to_string(),
        };
        let sql = format!(
            "select row_to_json(t)::text from {} t order by {order}",
            quote_ident(table)
        );
        let raw: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&mut *self.conn)
            .await
            .with_context(|| format!("read rows failed: {table}"))?;

        raw.into_iter()
            .map(|(json,)| {
                serde_json::from_str::<Record>(&json)
                    .with_context(|| format!("decode row failed: {table}"))
            })
            .collect()
    }

    async fn exists(&mut self, table: &str, filter: &Record) -> Result<bool> {
        let sql = format!(
            "select exists (select 1 from {} t where to_jsonb(t) @> $1::jsonb)",
            quote_ident(table)
        );
        let (exists,): (bool,) = sqlx::query_as(&sql)
            .bind(filter_json(filter)?)
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("exists query failed: {table}"))?;
        Ok(exists)
    }

    async fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        let q = quote_ident(table);
        let sql = if record.is_empty() {
            format!("insert into {q} default values")
        } else {
            let cols = record
                .keys()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "insert into {q} ({cols}) select {cols} from jsonb_populate_record(null::{q}, $1::jsonb)"
            )
        };

        let mut query = sqlx::query::<sqlx::Postgres>(&sql);
        if !record.is_empty() {
            query = query.bind(filter_json(record)?);
        }
        query
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("insert failed: {table}"))?;
        Ok(())
    }

    async fn delete(&mut self, table: &str, filter: &Record) -> Result<u64> {
        let sql = format!(
            "delete from {} as t where to_jsonb(t) @> $1::jsonb",
            quote_ident(table)
        );
        let res = sqlx::query(&sql)
            .bind(filter_json(filter)?)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("delete failed: {table}"))?;
        Ok(res.rows_affected())
    }

    async fn reset_sequence(&mut self, table: &str) -> Result<()> {
        let Some(pk) = self.primary_key(table).await? else {
            return Ok(());
        };

        let (seq,): (Option<String>,) = sqlx::query_as("select pg_get_serial_sequence($1, $2)")
            .bind(quote_ident(table))
            .bind(&pk)
            .fetch_one(&mut *self.conn)
            .await
            .with_context(|| format!("sequence lookup failed: {table}"))?;
        let Some(seq) = seq else {
            return Ok(());
        };

        let sql = format!(
            "select setval($1::regclass, coalesce((select max({}) from {}), 0) + 1, false)",
            quote_ident(&pk),
            quote_ident(table)
        );
        sqlx::query(&sql)
            .bind(seq)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("reset sequence failed: {table}"))?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.exec("begin").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.exec("commit").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.exec("rollback").await
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(&format!("savepoint {}", quote_ident(name))).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(&format!("rollback to savepoint {}", quote_ident(name)))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.exec(&format!("release savepoint {}", quote_ident(name)))
            .await
    }
}
