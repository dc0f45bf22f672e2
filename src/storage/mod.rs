//! Shared storage substrate: one SQLite database in WAL mode plus the
//! on-disk directory tree for object bodies and per-instance databases.
//!
//! Every stateful binding (KV, R2, Queues, Durable Objects, Workflows,
//! Cache) runs against the same pool. Per-DO SQL storage and D1 databases
//! are separate files opened on demand under the same data root.

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    root: PathBuf,
}

impl Storage {
    /// Open (or create) the substrate at `root`. Migration is idempotent:
    /// re-opening an already-migrated database is a no-op.
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let db_path = root.join("data.sqlite");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            root: root.to_path_buf(),
        })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Data root directory (parent of `data.sqlite`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding R2 object bodies for `bucket`.
    pub fn r2_dir(&self, bucket: &str) -> PathBuf {
        self.root.join("r2").join(bucket)
    }

    /// Directory holding in-progress multipart parts for `bucket`.
    pub fn r2_multipart_dir(&self, bucket: &str, upload_id: &str) -> PathBuf {
        self.r2_dir(bucket).join("__multipart__").join(upload_id)
    }

    /// Path of the dedicated SQL database for one DO instance.
    pub fn do_sql_path(&self, class_name: &str, instance_id: &str) -> PathBuf {
        self.root
            .join("do-sql")
            .join(class_name)
            .join(format!("{instance_id}.db"))
    }

    /// Path of a D1 database file.
    pub fn d1_path(&self, database_name: &str) -> PathBuf {
        self.root.join("d1").join(format!("{database_name}.sqlite"))
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        let sql = include_str!("migrations/001_init.sql");
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }

        // Idempotent column additions (ALTER TABLE IF NOT EXISTS is not
        // supported in SQLite, so we attempt the ALTER and ignore the
        // "duplicate column name" error).
        let alter_stmts = [
            "ALTER TABLE cache_entries ADD COLUMN vary_keys TEXT",
            "ALTER TABLE queue_messages ADD COLUMN completed_at INTEGER",
        ];
        for stmt in alter_stmts {
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Close the pool. Outstanding queries complete first.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current wall-clock time in epoch milliseconds. All substrate timestamps
/// (expirations, visibility, alarms) use this resolution.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s1 = Storage::open(dir.path()).await.unwrap();
        s1.close().await;
        // Second open re-runs the migration against the same file.
        let s2 = Storage::open(dir.path()).await.unwrap();
        sqlx::query("SELECT COUNT(*) FROM kv")
            .execute(&s2.pool())
            .await
            .unwrap();
        s2.close().await;
    }

    #[tokio::test]
    async fn layout_paths_are_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let s = Storage::open(dir.path()).await.unwrap();
        assert!(s.r2_dir("media").starts_with(dir.path()));
        assert!(s.do_sql_path("Counter", "abc").starts_with(dir.path()));
        assert!(s.d1_path("app").starts_with(dir.path()));
        s.close().await;
    }
}
