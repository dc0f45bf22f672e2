//! Per-instance SQL storage: a dedicated SQLite database opened lazily on
//! first access, under `<root>/do-sql/<class>/<instance-id>.db`.

use std::collections::VecDeque;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};

use crate::bindings::d1::D1Value;

#[derive(Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .create_if_missing(true);
        Ok(SqlitePool::connect_with(opts).await?)
    }

    /// Execute one statement and buffer its result set into a cursor.
    pub async fn exec(&self, sql: &str, params: Vec<D1Value>) -> Result<SqlCursor> {
        let mut conn = self.pool.acquire().await?;
        let mut query = sqlx::query(sql);
        for value in &params {
            query = match value {
                D1Value::Null => query.bind(Option::<i64>::None),
                D1Value::Integer(i) => query.bind(*i),
                D1Value::Real(f) => query.bind(*f),
                D1Value::Text(s) => query.bind(s.clone()),
                D1Value::Blob(b) => query.bind(b.clone()),
                D1Value::Undefined => {
                    return Err(anyhow!("undefined cannot be bound to a SQL parameter"))
                }
            };
        }
        let rows = query.fetch_all(&mut *conn).await?;
        let (changes,): (i64,) = sqlx::query_as("SELECT changes()")
            .fetch_one(&mut *conn)
            .await?;

        let column_names: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let mut buffered = VecDeque::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.columns().len());
            for i in 0..row.columns().len() {
                values.push(decode(row, i)?);
            }
            buffered.push_back(values);
        }
        let rows_read = buffered.len() as i64;
        Ok(SqlCursor {
            column_names,
            rows: buffered,
            rows_read,
            rows_written: changes,
        })
    }

    /// Size of the database in bytes, as reported by SQLite.
    pub async fn database_size(&self) -> Result<i64> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok(page_count * page_size)
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow, i: usize) -> Result<Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    Ok(match raw.type_info().name() {
        "INTEGER" => serde_json::json!(row.try_get::<i64, _>(i)?),
        "REAL" => serde_json::json!(row.try_get::<f64, _>(i)?),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get(i)?;
            Value::Array(bytes.into_iter().map(|b| serde_json::json!(b)).collect())
        }
        _ => Value::String(row.try_get::<String, _>(i)?),
    })
}

/// Buffered result cursor. Iteration yields row objects in insertion order;
/// `Iterator::next` doubles as the one-shot `next`.
pub struct SqlCursor {
    pub column_names: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    pub rows_read: i64,
    pub rows_written: i64,
}

impl SqlCursor {
    /// Remaining rows as objects.
    pub fn to_array(self) -> Vec<Value> {
        let columns = self.column_names.clone();
        self.rows
            .into_iter()
            .map(|values| row_object(&columns, values))
            .collect()
    }

    /// Remaining rows as positional arrays.
    pub fn raw(self) -> Vec<Vec<Value>> {
        self.rows.into_iter().collect()
    }

    /// Exactly one row, as an object.
    pub fn one(mut self) -> Result<Value> {
        let first = self
            .rows
            .pop_front()
            .ok_or_else(|| anyhow!("expected exactly one row, got none"))?;
        if !self.rows.is_empty() {
            return Err(anyhow!(
                "expected exactly one row, got {}",
                self.rows.len() + 1
            ));
        }
        Ok(row_object(&self.column_names, first))
    }
}

impl Iterator for SqlCursor {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let values = self.rows.pop_front()?;
        Some(row_object(&self.column_names, values))
    }
}

fn row_object(columns: &[String], values: Vec<Value>) -> Value {
    let mut map = Map::new();
    for (name, value) in columns.iter().zip(values) {
        map.insert(name.clone(), value);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sql(dir: &std::path::Path) -> SqlStorage {
        let pool = SqlStorage::open_pool(&dir.join("instance.db")).await.unwrap();
        SqlStorage::new(pool)
    }

    #[tokio::test]
    async fn exec_and_cursor_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let s = sql(dir.path()).await;
        s.exec("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", vec![])
            .await
            .unwrap();
        let write = s
            .exec(
                "INSERT INTO notes (body) VALUES (?), (?)",
                vec![D1Value::from("first"), D1Value::from("second")],
            )
            .await
            .unwrap();
        assert_eq!(write.rows_written, 2);

        let cursor = s
            .exec("SELECT id, body FROM notes ORDER BY id", vec![])
            .await
            .unwrap();
        assert_eq!(cursor.column_names, vec!["id", "body"]);
        assert_eq!(cursor.rows_read, 2);
        let rows = cursor.to_array();
        assert_eq!(rows[0], json!({"id": 1, "body": "first"}));
        assert_eq!(rows[1], json!({"id": 2, "body": "second"}));
    }

    #[tokio::test]
    async fn iteration_order_and_one_shot_next() {
        let dir = tempfile::tempdir().unwrap();
        let s = sql(dir.path()).await;
        s.exec("CREATE TABLE t (v INTEGER)", vec![]).await.unwrap();
        s.exec("INSERT INTO t VALUES (1), (2), (3)", vec![]).await.unwrap();

        let mut cursor = s.exec("SELECT v FROM t ORDER BY v", vec![]).await.unwrap();
        assert_eq!(cursor.next(), Some(json!({"v": 1})));
        let rest: Vec<Value> = cursor.collect();
        assert_eq!(rest, vec![json!({"v": 2}), json!({"v": 3})]);
    }

    #[tokio::test]
    async fn one_requires_exactly_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let s = sql(dir.path()).await;
        s.exec("CREATE TABLE t (v INTEGER)", vec![]).await.unwrap();
        assert!(s.exec("SELECT v FROM t", vec![]).await.unwrap().one().is_err());
        s.exec("INSERT INTO t VALUES (7)", vec![]).await.unwrap();
        let one = s.exec("SELECT v FROM t", vec![]).await.unwrap().one().unwrap();
        assert_eq!(one, json!({"v": 7}));
    }

    #[tokio::test]
    async fn raw_returns_positional_rows() {
        let dir = tempfile::tempdir().unwrap();
        let s = sql(dir.path()).await;
        s.exec("CREATE TABLE t (a INTEGER, b TEXT)", vec![]).await.unwrap();
        s.exec("INSERT INTO t VALUES (1, 'x')", vec![]).await.unwrap();
        let raw = s.exec("SELECT a, b FROM t", vec![]).await.unwrap().raw();
        assert_eq!(raw, vec![vec![json!(1), json!("x")]]);
    }
}
