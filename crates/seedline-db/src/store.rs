use anyhow::Result;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One row: column name -> value.
///
/// `BTreeMap` keeps columns in name order, which is the order every
/// generated artifact uses.
pub type Record = BTreeMap<String, Value>;

/// Relational persistence seam.
///
/// Implementations are driven by a single writer, one call at a time.
/// Transactions are explicit: `begin` opens one, `commit`/`rollback` closes it.
/// Nesting is not supported; savepoints are. As in Postgres, a failed
/// statement inside a transaction poisons it until the transaction or an
/// enclosing savepoint is rolled back.
#[async_trait::async_trait]
pub trait Store: Send {
    /// Create the ledger table if it does not exist yet.
    async fn install(&mut self) -> Result<()>;

    /// All table names, sorted.
    async fn tables(&mut self) -> Result<Vec<String>>;

    /// Column names of `table` in declaration order.
    async fn columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Primary key column of `table`, if it has one. Composite keys report
    /// their first column.
    async fn primary_key(&mut self, table: &str) -> Result<Option<String>>;

    async fn has_rows(&mut self, table: &str) -> Result<bool>;

    /// Every row of `table`, ordered by primary key ascending.
    async fn rows(&mut self, table: &str) -> Result<Vec<Record>>;

    /// True if some row matches every (column, value) pair of `filter`.
    async fn exists(&mut self, table: &str, filter: &Record) -> Result<bool>;

    /// Insert one row. Columns missing from `record` take their defaults.
    async fn insert(&mut self, table: &str, record: &Record) -> Result<()>;

    /// Delete every row matching `filter`; returns how many went away.
    async fn delete(&mut self, table: &str, filter: &Record) -> Result<u64>;

    /// Move the table's id sequence past the largest stored primary key.
    /// No-op for tables without a sequence-backed key.
    async fn reset_sequence(&mut self, table: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Mark a point inside the open transaction that a failed statement
    /// can be undone to without losing the rest of the transaction.
    async fn savepoint(&mut self, name: &str) -> Result<()>;

    /// Undo everything since `savepoint(name)` and clear a failed state.
    /// The savepoint stays defined.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
}

/// Total order over JSON values used when sorting rows by key.
///
/// null < bool < number < string < array < object; numbers compare
/// numerically, everything else by its natural or serialized order.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let (f, g) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                f.partial_cmp(&g).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
