//! D1 binding: a SQL database proxy over one SQLite file per configured
//! database name, opened on demand under `<root>/d1/<name>.sqlite`.
//!
//! Prepared statements are immutable — `bind` returns a new statement.
//! Result metadata mirrors the platform's `meta` object.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use anyhow::Result;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::trace::BindingTracer;

#[derive(Debug, thiserror::Error)]
pub enum D1Error {
    #[error("D1_TYPE_ERROR: undefined cannot be bound")]
    UndefinedBinding,
    #[error("D1_ERROR: unknown column '{0}'")]
    UnknownColumn(String),
}

// ─── Values ───────────────────────────────────────────────────────────────────

/// A bindable D1 parameter. Booleans are coerced to 0/1 at construction;
/// `Undefined` exists so the explicit type error can be surfaced at bind
/// time, matching the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum D1Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Undefined,
}

impl From<bool> for D1Value {
    fn from(b: bool) -> Self {
        D1Value::Integer(if b { 1 } else { 0 })
    }
}

impl From<i64> for D1Value {
    fn from(i: i64) -> Self {
        D1Value::Integer(i)
    }
}

impl From<f64> for D1Value {
    fn from(f: f64) -> Self {
        D1Value::Real(f)
    }
}

impl From<&str> for D1Value {
    fn from(s: &str) -> Self {
        D1Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for D1Value {
    fn from(b: Vec<u8>) -> Self {
        D1Value::Blob(b)
    }
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct D1Meta {
    pub changes: i64,
    pub last_row_id: i64,
    /// Milliseconds spent executing.
    pub duration: f64,
    pub size_after: i64,
    pub rows_read: i64,
    pub rows_written: i64,
    pub changed_db: bool,
    pub served_by: &'static str,
}

#[derive(Debug, Clone)]
pub struct D1Result {
    pub results: Vec<Value>,
    pub meta: D1Meta,
}

#[derive(Debug, Clone)]
pub struct D1ExecResult {
    pub count: usize,
    /// Milliseconds.
    pub duration: f64,
}

// ─── Database ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct D1Database {
    pool: SqlitePool,
    path: PathBuf,
    tracer: BindingTracer,
}

impl D1Database {
    /// Open (creating if missing) the database file for `name`.
    pub async fn open(path: PathBuf, tracer: BindingTracer) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Ok(Self { pool, path, tracer })
    }

    pub fn prepare(&self, sql: &str) -> D1PreparedStatement {
        D1PreparedStatement {
            db: self.clone(),
            sql: sql.to_string(),
            bindings: Vec::new(),
        }
    }

    /// Run every statement in one transaction; any failure rolls the whole
    /// batch back.
    pub async fn batch(&self, statements: Vec<D1PreparedStatement>) -> Result<Vec<D1Result>> {
        let _span = self.tracer.span("batch", None);
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(statements.len());
        for stmt in &statements {
            let rows = match stmt.fetch_in(&mut tx).await {
                Ok(rows) => rows,
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            };
            results.push(rows);
        }
        tx.commit().await?;
        let duration = started.elapsed().as_secs_f64() * 1000.0;
        let size_after = self.size().await;
        let mut out = Vec::with_capacity(results.len());
        for (rows, changes, last_row_id) in results {
            out.push(D1Result {
                meta: self.meta(changes, last_row_id, duration, rows.len() as i64),
                results: rows,
            });
        }
        Ok(out
            .into_iter()
            .map(|mut r| {
                r.meta.size_after = size_after;
                r
            })
            .collect())
    }

    /// Execute a multi-statement SQL string. Splitting respects string
    /// literals (with doubled-quote escapes) and line/block comments.
    pub async fn exec(&self, sql: &str) -> Result<D1ExecResult> {
        let _span = self.tracer.span("exec", None);
        let started = Instant::now();
        let statements = split_sql_statements(sql);
        let mut count = 0;
        for stmt in &statements {
            sqlx::query(stmt).execute(&self.pool).await?;
            count += 1;
        }
        Ok(D1ExecResult {
            count,
            duration: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Full database snapshot as bytes (WAL is checkpointed first).
    pub async fn dump(&self) -> Result<Vec<u8>> {
        let _span = self.tracer.span("dump", None);
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Session handle exposing `prepare`, `batch`, `get_bookmark` only.
    pub fn with_session(&self, bookmark: Option<String>) -> D1Session {
        D1Session {
            db: self.clone(),
            bookmark: bookmark.unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }

    async fn size(&self) -> i64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0)
    }

    fn meta(&self, changes: i64, last_row_id: i64, duration: f64, rows_read: i64) -> D1Meta {
        D1Meta {
            changes,
            last_row_id,
            duration,
            size_after: 0,
            rows_read,
            rows_written: changes,
            changed_db: changes > 0,
            served_by: "bunflare",
        }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

pub struct D1Session {
    db: D1Database,
    bookmark: String,
}

impl D1Session {
    pub fn prepare(&self, sql: &str) -> D1PreparedStatement {
        self.db.prepare(sql)
    }

    pub async fn batch(&self, statements: Vec<D1PreparedStatement>) -> Result<Vec<D1Result>> {
        self.db.batch(statements).await
    }

    pub fn get_bookmark(&self) -> &str {
        &self.bookmark
    }
}

// ─── Prepared statement ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct D1PreparedStatement {
    db: D1Database,
    sql: String,
    bindings: Vec<D1Value>,
}

impl D1PreparedStatement {
    /// Immutable composition: returns a new statement holding `args`.
    pub fn bind(&self, args: Vec<D1Value>) -> D1PreparedStatement {
        D1PreparedStatement {
            db: self.db.clone(),
            sql: self.sql.clone(),
            bindings: args,
        }
    }

    /// First row as an object, or the value of `column` from the first row.
    /// A present row with a missing column is an explicit error.
    pub async fn first(&self, column: Option<&str>) -> Result<Option<Value>> {
        let result = self.all().await?;
        let Some(row) = result.results.into_iter().next() else {
            return Ok(None);
        };
        match column {
            None => Ok(Some(row)),
            Some(col) => match row.get(col) {
                Some(v) => Ok(Some(v.clone())),
                None => Err(D1Error::UnknownColumn(col.to_string()).into()),
            },
        }
    }

    pub async fn all(&self) -> Result<D1Result> {
        let _span = self.db.tracer.span("all", None);
        self.execute_collect().await
    }

    /// Like `all` but the platform's `run` shape (meta-focused; results are
    /// still populated for RETURNING statements).
    pub async fn run(&self) -> Result<D1Result> {
        let _span = self.db.tracer.span("run", None);
        self.execute_collect().await
    }

    /// Rows as positional arrays; with `column_names`, a header array is
    /// prepended.
    pub async fn raw(&self, column_names: bool) -> Result<Vec<Value>> {
        let _span = self.db.tracer.span("raw", None);
        let mut conn = self.db.pool.acquire().await?;
        let rows = self.query()?.fetch_all(&mut *conn).await?;

        let mut out = Vec::with_capacity(rows.len() + 1);
        if column_names {
            let header: Vec<Value> = rows
                .first()
                .map(|row| {
                    row.columns()
                        .iter()
                        .map(|c| Value::String(c.name().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            out.push(Value::Array(header));
        }
        for row in &rows {
            let mut arr = Vec::with_capacity(row.columns().len());
            for i in 0..row.columns().len() {
                arr.push(value_at(row, i)?);
            }
            out.push(Value::Array(arr));
        }
        Ok(out)
    }

    fn query(&self) -> Result<sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>>> {
        let mut q = sqlx::query(&self.sql);
        for value in &self.bindings {
            q = match value {
                D1Value::Null => q.bind(Option::<i64>::None),
                D1Value::Integer(i) => q.bind(*i),
                D1Value::Real(f) => q.bind(*f),
                D1Value::Text(s) => q.bind(s.clone()),
                D1Value::Blob(b) => q.bind(b.clone()),
                D1Value::Undefined => return Err(D1Error::UndefinedBinding.into()),
            };
        }
        Ok(q)
    }

    async fn execute_collect(&self) -> Result<D1Result> {
        let started = Instant::now();
        let mut conn = self.db.pool.acquire().await?;
        let rows = self.query()?.fetch_all(&mut *conn).await?;
        // changes()/last_insert_rowid() are per-connection, so read them on
        // the same connection the statement ran on.
        let (changes, last_row_id): (i64, i64) =
            sqlx::query_as("SELECT changes(), last_insert_rowid()")
                .fetch_one(&mut *conn)
                .await?;
        drop(conn);
        let duration = started.elapsed().as_secs_f64() * 1000.0;

        let results = rows
            .iter()
            .map(row_to_object)
            .collect::<Result<Vec<_>>>()?;
        let mut meta = self
            .db
            .meta(changes, last_row_id, duration, results.len() as i64);
        meta.size_after = self.db.size().await;
        Ok(D1Result { results, meta })
    }

    /// Transaction-scoped fetch used by `batch`.
    async fn fetch_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<(Vec<Value>, i64, i64)> {
        let rows = self.query()?.fetch_all(&mut **tx).await?;
        let (changes, last_row_id): (i64, i64) =
            sqlx::query_as("SELECT changes(), last_insert_rowid()")
                .fetch_one(&mut **tx)
                .await?;
        let results = rows
            .iter()
            .map(row_to_object)
            .collect::<Result<Vec<_>>>()?;
        Ok((results, changes, last_row_id))
    }
}

// ─── Row decoding ─────────────────────────────────────────────────────────────

fn row_to_object(row: &SqliteRow) -> Result<Value> {
    let mut map = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        map.insert(col.name().to_string(), value_at(row, i)?);
    }
    Ok(Value::Object(map))
}

fn value_at(row: &SqliteRow, i: usize) -> Result<Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    Ok(match raw.type_info().name() {
        "INTEGER" => json!(row.try_get::<i64, _>(i)?),
        "REAL" => json!(row.try_get::<f64, _>(i)?),
        "BLOB" => {
            // Blobs surface as arrays of byte values, like the platform.
            let bytes: Vec<u8> = row.try_get(i)?;
            Value::Array(bytes.into_iter().map(|b| json!(b)).collect())
        }
        _ => Value::String(row.try_get::<String, _>(i)?),
    })
}

// ─── Statement splitting ──────────────────────────────────────────────────────

/// Split a SQL script on top-level semicolons, respecting single/double
/// quoted literals (with doubled-quote escapes), `-- …` line comments, and
/// `/* … */` block comments.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let bytes: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            '\'' | '"' => {
                let quote = c;
                current.push(c);
                i += 1;
                while i < bytes.len() {
                    current.push(bytes[i]);
                    if bytes[i] == quote {
                        // Doubled quote is an escaped literal quote.
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            current.push(bytes[i + 1]);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] == '-' => {
                while i < bytes.len() && bytes[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            ';' => {
                let stmt = current.trim().to_string();
                if !stmt.is_empty() {
                    statements.push(stmt);
                }
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db(dir: &std::path::Path) -> D1Database {
        D1Database::open(dir.join("test.sqlite"), BindingTracer::disabled("d1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn prepare_bind_run_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL)")
            .await
            .unwrap();
        let insert = db.prepare("INSERT INTO users (name, score) VALUES (?, ?)");
        let result = insert
            .bind(vec![D1Value::from("ada"), D1Value::from(9.5)])
            .run()
            .await
            .unwrap();
        assert_eq!(result.meta.changes, 1);
        assert_eq!(result.meta.last_row_id, 1);
        assert!(result.meta.changed_db);
        assert_eq!(result.meta.served_by, "bunflare");

        let row = db
            .prepare("SELECT name, score FROM users WHERE id = ?")
            .bind(vec![D1Value::from(1i64)])
            .first(None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], "ada");
        assert_eq!(row["score"], 9.5);
    }

    #[tokio::test]
    async fn bind_returns_new_statement() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (v INTEGER)").await.unwrap();
        db.prepare("INSERT INTO t VALUES (1), (2)").run().await.unwrap();
        let base = db.prepare("SELECT v FROM t WHERE v = ?");
        let one = base.bind(vec![D1Value::from(1i64)]);
        let two = base.bind(vec![D1Value::from(2i64)]);
        // The original statement is untouched by either bind.
        assert!(base.bindings.is_empty());
        assert_eq!(one.first(Some("v")).await.unwrap().unwrap(), json!(1));
        assert_eq!(two.first(Some("v")).await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn first_unknown_column_is_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1)")
            .await
            .unwrap();
        let err = db
            .prepare("SELECT v FROM t")
            .first(Some("nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown column"));
        // No row → null, not an error.
        let none = db
            .prepare("SELECT v FROM t WHERE v = 99")
            .first(Some("nope"))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn undefined_binding_is_type_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        let err = db
            .prepare("SELECT ?")
            .bind(vec![D1Value::Undefined])
            .all()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("D1_TYPE_ERROR"));
    }

    #[tokio::test]
    async fn booleans_bind_as_integers_and_blobs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (flag INTEGER, data BLOB)").await.unwrap();
        db.prepare("INSERT INTO t VALUES (?, ?)")
            .bind(vec![D1Value::from(true), D1Value::from(vec![1u8, 2, 255])])
            .run()
            .await
            .unwrap();
        let row = db
            .prepare("SELECT flag, data FROM t")
            .first(None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["flag"], json!(1));
        assert_eq!(row["data"], json!([1, 2, 255]));
    }

    #[tokio::test]
    async fn batch_rolls_back_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (v INTEGER UNIQUE)").await.unwrap();
        let err = db
            .batch(vec![
                db.prepare("INSERT INTO t VALUES (1)"),
                db.prepare("INSERT INTO t VALUES (1)"), // unique violation
            ])
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());
        let count = db
            .prepare("SELECT COUNT(*) AS n FROM t")
            .first(Some("n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, json!(0));
    }

    #[tokio::test]
    async fn raw_returns_positional_arrays_with_optional_header() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (a INTEGER, b TEXT); INSERT INTO t VALUES (1, 'x'), (2, 'y')")
            .await
            .unwrap();
        let rows = db.prepare("SELECT a, b FROM t ORDER BY a").raw(false).await.unwrap();
        assert_eq!(rows, vec![json!([1, "x"]), json!([2, "y"])]);
        let with_header = db.prepare("SELECT a, b FROM t ORDER BY a").raw(true).await.unwrap();
        assert_eq!(with_header[0], json!(["a", "b"]));
        assert_eq!(with_header.len(), 3);
    }

    #[tokio::test]
    async fn exec_counts_statements_and_respects_literals() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        let result = db
            .exec(
                "CREATE TABLE t (v TEXT); -- trailing; comment\n\
                 INSERT INTO t VALUES ('semi;colon');\n\
                 /* block; comment */ INSERT INTO t VALUES ('it''s');",
            )
            .await
            .unwrap();
        assert_eq!(result.count, 3);
        let rows = db.prepare("SELECT v FROM t ORDER BY v").raw(false).await.unwrap();
        assert_eq!(rows, vec![json!(["it's"]), json!(["semi;colon"])]);
    }

    #[tokio::test]
    async fn dump_returns_database_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        db.exec("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (42)")
            .await
            .unwrap();
        let bytes = db.dump().await.unwrap();
        // SQLite file magic.
        assert!(bytes.starts_with(b"SQLite format 3\0"));
    }

    #[tokio::test]
    async fn session_exposes_bookmark() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path()).await;
        let session = db.with_session(Some("bm-1".into()));
        assert_eq!(session.get_bookmark(), "bm-1");
        let fresh = db.with_session(None);
        assert!(!fresh.get_bookmark().is_empty());
    }

    #[test]
    fn split_statements_edge_cases() {
        let stmts = split_sql_statements("SELECT 1; SELECT ';'; -- c;\nSELECT 2");
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[1], "SELECT ';'");
    }
}
