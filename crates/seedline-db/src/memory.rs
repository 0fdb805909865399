//! In-process relational store.
//!
//! Behaves like a small Postgres for the subset of operations seedline uses:
//! declared columns, a primary key with an auto-increment sequence, unique
//! columns, and snapshot-based transactions. Explicit ids do NOT advance the
//! sequence, exactly like a serial column, so `reset_sequence` matters here too.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::ledger::LEDGER_TABLE;
use crate::store::{compare_values, Record, Store};

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<String>,
    primary_key: Option<String>,
    unique: Vec<String>,
    rows: Vec<Record>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, MemTable>,
    /// Table state captured at `begin`; restored on `rollback`.
    saved: Option<BTreeMap<String, MemTable>>,
    /// Open savepoints, innermost last.
    savepoints: Vec<(String, BTreeMap<String, MemTable>)>,
    /// A statement failed inside the open transaction.
    aborted: bool,
    rejected: BTreeSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare, dropping existing rows) a table.
    pub fn with_table(mut self, name: &str, columns: &[&str], primary_key: Option<&str>) -> Self {
        self.define_table(name, columns, primary_key);
        self
    }

    pub fn define_table(&mut self, name: &str, columns: &[&str], primary_key: Option<&str>) {
        let mut cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        if let Some(pk) = primary_key {
            if !cols.iter().any(|c| c == pk) {
                cols.insert(0, pk.to_string());
            }
        }
        self.tables.insert(
            name.to_string(),
            MemTable {
                columns: cols,
                primary_key: primary_key.map(|s| s.to_string()),
                unique: Vec::new(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    /// Make every subsequent insert into `table` fail.
    pub fn reject_writes_to(&mut self, table: &str) {
        self.rejected.insert(table.to_string());
    }

    pub fn allow_writes_to(&mut self, table: &str) {
        self.rejected.remove(table);
    }

    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    /// True while the open transaction refuses statements after a failure.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("relation \"{name}\" does not exist"))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("relation \"{name}\" does not exist"))
    }

    fn usable(&self) -> Result<()> {
        if self.aborted {
            bail!("current transaction is aborted, commands ignored until end of transaction block");
        }
        Ok(())
    }

    /// Run one statement with Postgres failure semantics: an error inside
    /// an open transaction aborts it.
    fn statement<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.usable()?;
        let res = f(self);
        if res.is_err() && self.saved.is_some() {
            self.aborted = true;
        }
        res
    }

    fn end_transaction(&mut self) {
        self.saved = None;
        self.savepoints.clear();
        self.aborted = false;
    }

    fn rows_sorted(&self, table: &str) -> Result<Vec<Record>> {
        let t = self.table(table)?;
        let mut rows = t.rows.clone();
        if let Some(pk) = &t.primary_key {
            rows.sort_by(|a, b| {
                compare_values(
                    a.get(pk).unwrap_or(&Value::Null),
                    b.get(pk).unwrap_or(&Value::Null),
                )
            });
        }
        Ok(rows)
    }

    fn insert_row(&mut self, table: &str, record: &Record) -> Result<()> {
        if self.rejected.contains(table) {
            bail!("write rejected for relation \"{table}\"");
        }
        let t = self.table_mut(table)?;

        if let Some(unknown) = record.keys().find(|k| !t.columns.contains(k)) {
            bail!("column \"{unknown}\" of relation \"{table}\" does not exist");
        }

        let mut row: Record = t
            .columns
            .iter()
            .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null)))
            .collect();

        if let Some(pk) = t.primary_key.clone() {
            if row.get(&pk).map(Value::is_null).unwrap_or(true) {
                row.insert(pk.clone(), Value::from(t.next_id));
                t.next_id += 1;
            }
            let key = row.get(&pk).cloned().unwrap_or(Value::Null);
            if t.rows.iter().any(|r| r.get(&pk) == Some(&key)) {
                bail!("duplicate key value violates primary key of \"{table}\" ({pk}={key})");
            }
        }

        for col in &t.unique {
            let v = row.get(col).cloned().unwrap_or(Value::Null);
            if !v.is_null() && t.rows.iter().any(|r| r.get(col) == Some(&v)) {
                bail!("duplicate key value violates unique constraint on \"{table}\" ({col}={v})");
            }
        }

        t.rows.push(row);
        Ok(())
    }

    fn delete_rows(&mut self, table: &str, filter: &Record) -> Result<u64> {
        if self.rejected.contains(table) {
            bail!("write rejected for relation \"{table}\"");
        }
        let t = self.table_mut(table)?;
        let before = t.rows.len();
        t.rows.retain(|r| !matches(r, filter));
        Ok((before - t.rows.len()) as u64)
    }

    fn reset_sequence_of(&mut self, table: &str) -> Result<()> {
        let t = self.table_mut(table)?;
        let Some(pk) = t.primary_key.clone() else {
            return Ok(());
        };
        let max = t
            .rows
            .iter()
            .filter_map(|r| r.get(&pk).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        t.next_id = max + 1;
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("savepoint \"{name}\" does not exist"))
    }
}

fn matches(row: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .all(|(k, v)| row.get(k).map(|rv| rv == v).unwrap_or(false))
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn install(&mut self) -> Result<()> {
        if self.tables.contains_key(LEDGER_TABLE) {
            return Ok(());
        }
        self.define_table(
            LEDGER_TABLE,
            &["id", "version", "runtime", "migrated_on"],
            Some("id"),
        );
        self.table_mut(LEDGER_TABLE)?.unique.push("version".to_string());
        Ok(())
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        self.statement(|s| Ok(s.tables.keys().cloned().collect()))
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        self.statement(|s| Ok(s.table(table)?.columns.clone()))
    }

    async fn primary_key(&mut self, table: &str) -> Result<Option<String>> {
        self.statement(|s| Ok(s.table(table)?.primary_key.clone()))
    }

    async fn has_rows(&mut self, table: &str) -> Result<bool> {
        self.statement(|s| Ok(!s.table(table)?.rows.is_empty()))
    }

    async fn rows(&mut self, table: &str) -> Result<Vec<Record>> {
        self.statement(|s| s.rows_sorted(table))
    }

    async fn exists(&mut self, table: &str, filter: &Record) -> Result<bool> {
        self.statement(|s| Ok(s.table(table)?.rows.iter().any(|r| matches(r, filter))))
    }

    async fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        self.statement(|s| s.insert_row(table, record))
    }

    async fn delete(&mut self, table: &str, filter: &Record) -> Result<u64> {
        self.statement(|s| s.delete_rows(table, filter))
    }

    async fn reset_sequence(&mut self, table: &str) -> Result<()> {
        self.statement(|s| s.reset_sequence_of(table))
    }

    async fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            bail!("transaction already open");
        }
        self.saved = Some(self.tables.clone());
        Ok(())
    }

    /// Like Postgres, committing an aborted transaction rolls it back.
    async fn commit(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| anyhow!("commit without an open transaction"))?;
        if self.aborted {
            self.tables = saved;
        }
        self.end_transaction();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| anyhow!("rollback without an open transaction"))?;
        self.tables = saved;
        self.end_transaction();
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        if self.saved.is_none() {
            bail!("SAVEPOINT can only be used in transaction blocks");
        }
        self.usable()?;
        self.savepoints.push((name.to_string(), self.tables.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let i = self.savepoint_index(name)?;
        self.savepoints.truncate(i + 1);
        self.tables = self.savepoints[i].1.clone();
        self.aborted = false;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.usable()?;
        let i = self.savepoint_index(name)?;
        self.savepoints.truncate(i);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn explicit_ids_do_not_advance_sequence() {
        let mut s = MemoryStore::new().with_table("users", &["id", "name"], Some("id"));
        s.insert("users", &rec(json!({"id": 1, "name": "a"}))).await.unwrap();

        let err = s.insert("users", &rec(json!({"name": "b"}))).await.unwrap_err();
        assert!(format!("{err}").contains("duplicate key"), "got: {err}");

        s.reset_sequence("users").await.unwrap();
        s.insert("users", &rec(json!({"name": "b"}))).await.unwrap();
        let rows = s.rows("users").await.unwrap();
        assert_eq!(rows[1]["id"], json!(2));
    }

    #[tokio::test]
    async fn rollback_restores_rows() {
        let mut s = MemoryStore::new().with_table("t", &["id"], Some("id"));
        s.begin().await.unwrap();
        s.insert("t", &Record::new()).await.unwrap();
        assert_eq!(s.row_count("t"), 1);
        s.rollback().await.unwrap();
        assert_eq!(s.row_count("t"), 0);
        assert!(!s.in_transaction());
    }

    #[tokio::test]
    async fn rows_come_back_in_key_order() {
        let mut s = MemoryStore::new().with_table("t", &["id"], Some("id"));
        for id in [10, 2, 7] {
            s.insert("t", &rec(json!({"id": id}))).await.unwrap();
        }
        let ids: Vec<i64> = s
            .rows("t")
            .await
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 7, 10]);
    }

    #[tokio::test]
    async fn unknown_column_is_rejected() {
        let mut s = MemoryStore::new().with_table("t", &["id"], Some("id"));
        assert!(s.insert("t", &rec(json!({"nope": 1}))).await.is_err());
    }

    #[tokio::test]
    async fn failed_statement_poisons_transaction_until_savepoint_rollback() {
        let mut s = MemoryStore::new().with_table("t", &["id"], Some("id"));
        s.begin().await.unwrap();
        s.insert("t", &Record::new()).await.unwrap();
        s.savepoint("sp").await.unwrap();
        assert!(s.insert("t", &rec(json!({"id": 1}))).await.is_err());
        assert!(s.is_aborted());
        assert!(s.has_rows("t").await.is_err());

        s.rollback_to_savepoint("sp").await.unwrap();
        s.release_savepoint("sp").await.unwrap();
        s.insert("t", &Record::new()).await.unwrap();
        s.commit().await.unwrap();
        assert_eq!(s.row_count("t"), 2);
    }

    #[tokio::test]
    async fn committing_an_aborted_transaction_discards_it() {
        let mut s = MemoryStore::new().with_table("t", &["id"], Some("id"));
        s.begin().await.unwrap();
        s.insert("t", &Record::new()).await.unwrap();
        assert!(s.insert("nope", &Record::new()).await.is_err());
        s.commit().await.unwrap();
        assert_eq!(s.row_count("t"), 0);
        assert!(!s.in_transaction());
        assert!(!s.is_aborted());
    }

    #[tokio::test]
    async fn savepoint_needs_a_transaction() {
        let mut s = MemoryStore::new();
        assert!(s.savepoint("sp").await.is_err());
    }
}
