//! Persistent key/value storage for one Durable Object instance, plus the
//! alarm API. Values are serialized to JSON bytes; multi-key puts run in a
//! single transaction.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::alarm::AlarmScheduler;
use crate::bindings::kv::escape_like;

#[derive(Debug, Clone, Default)]
pub struct DoListOptions {
    pub prefix: Option<String>,
    /// Inclusive lower bound.
    pub start: Option<String>,
    /// Exclusive upper bound.
    pub end: Option<String>,
    pub limit: Option<i64>,
    pub reverse: bool,
}

#[derive(Clone)]
pub struct DoStorage {
    pool: SqlitePool,
    class_name: String,
    instance_id: String,
    alarms: AlarmScheduler,
}

impl DoStorage {
    pub(crate) fn new(
        pool: SqlitePool,
        class_name: String,
        instance_id: String,
        alarms: AlarmScheduler,
    ) -> Self {
        Self {
            pool,
            class_name,
            instance_id,
            alarms,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM do_storage WHERE namespace = ? AND instance_id = ? AND key = ?",
        )
        .bind(&self.class_name)
        .bind(&self.instance_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(bytes,)| Ok(serde_json::from_slice(&bytes)?))
            .transpose()
    }

    /// Multi-key get; missing keys are simply absent from the map.
    pub async fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.to_string(), value);
            }
        }
        Ok(out)
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.put_many(vec![(key.to_string(), value)]).await
    }

    /// All entries land atomically in one transaction.
    pub async fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in &entries {
            self.put_in(&mut tx, key, value).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO do_storage (namespace, instance_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(namespace, instance_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&self.class_name)
        .bind(&self.instance_id)
        .bind(key)
        .bind(serde_json::to_vec(value)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM do_storage WHERE namespace = ? AND instance_id = ? AND key = ?",
        )
        .bind(&self.class_name)
        .bind(&self.instance_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns how many keys were deleted.
    pub async fn delete_many(&self, keys: &[&str]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM do_storage WHERE namespace = ? AND instance_id = ?")
            .bind(&self.class_name)
            .bind(&self.instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Keys in order with their values. `start` is inclusive, `end`
    /// exclusive; `reverse` returns descending keys.
    pub async fn list(&self, opts: DoListOptions) -> Result<Vec<(String, Value)>> {
        let mut sql = String::from(
            "SELECT key, value FROM do_storage WHERE namespace = ? AND instance_id = ?",
        );
        if opts.prefix.is_some() {
            sql.push_str(" AND key LIKE ? ESCAPE '\\'");
        }
        if opts.start.is_some() {
            sql.push_str(" AND key >= ?");
        }
        if opts.end.is_some() {
            sql.push_str(" AND key < ?");
        }
        sql.push_str(if opts.reverse {
            " ORDER BY key DESC"
        } else {
            " ORDER BY key ASC"
        });
        if opts.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query_as::<_, (String, Vec<u8>)>(&sql)
            .bind(&self.class_name)
            .bind(&self.instance_id);
        if let Some(prefix) = &opts.prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        if let Some(start) = &opts.start {
            query = query.bind(start.clone());
        }
        if let Some(end) = &opts.end {
            query = query.bind(end.clone());
        }
        if let Some(limit) = opts.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(key, bytes)| Ok((key, serde_json::from_slice(&bytes)?)))
            .collect()
    }

    /// Run `cb` against a transaction-scoped view; rolled back when it
    /// errors, committed otherwise.
    pub async fn transaction<F, Fut, T>(&self, cb: F) -> Result<T>
    where
        F: FnOnce(DoTransaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let tx = self.pool.begin().await?;
        let txn = DoTransaction {
            storage: self.clone(),
            tx: Arc::new(tokio::sync::Mutex::new(Some(tx))),
        };
        let handle = txn.clone();
        match cb(txn).await {
            Ok(value) => {
                if let Some(tx) = handle.tx.lock().await.take() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if let Some(tx) = handle.tx.lock().await.take() {
                    tx.rollback().await?;
                }
                Err(e)
            }
        }
    }

    // ── Alarm API ─────────────────────────────────────────────────────────

    /// Scheduled alarm time in epoch ms, if one is set.
    pub async fn get_alarm(&self) -> Result<Option<i64>> {
        self.alarms.get(&self.instance_id).await
    }

    /// Schedule (or replace) the instance alarm.
    pub async fn set_alarm(&self, scheduled_at_ms: i64) -> Result<()> {
        self.alarms.set(&self.instance_id, scheduled_at_ms).await
    }

    pub async fn delete_alarm(&self) -> Result<()> {
        self.alarms.delete(&self.instance_id).await
    }
}

/// Transaction-scoped storage view passed to `transaction` callbacks.
#[derive(Clone)]
pub struct DoTransaction {
    storage: DoStorage,
    tx: Arc<tokio::sync::Mutex<Option<Transaction<'static, Sqlite>>>>,
}

impl DoTransaction {
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| anyhow!("transaction finished"))?;
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM do_storage WHERE namespace = ? AND instance_id = ? AND key = ?",
        )
        .bind(&self.storage.class_name)
        .bind(&self.storage.instance_id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|(bytes,)| Ok(serde_json::from_slice(&bytes)?))
            .transpose()
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| anyhow!("transaction finished"))?;
        self.storage.put_in(tx, key, &value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| anyhow!("transaction finished"))?;
        let result = sqlx::query(
            "DELETE FROM do_storage WHERE namespace = ? AND instance_id = ? AND key = ?",
        )
        .bind(&self.storage.class_name)
        .bind(&self.storage.instance_id)
        .bind(key)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
