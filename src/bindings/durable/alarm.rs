//! Alarm timers for Durable Object instances.
//!
//! One timer task per armed alarm. Firing deletes the persisted row first,
//! then runs the instance's `alarm` handler behind the normal serialization
//! locks. A failing handler is retried with exponential backoff; the row is
//! re-persisted between attempts so a process restart picks them up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::storage::now_ms;
use crate::worker::AlarmInfo;

use super::NamespaceInner;

/// Retry delays in seconds; the handler gets at most six retries.
const BACKOFF_SECS: [u64; 6] = [1, 2, 4, 8, 16, 32];

#[derive(Clone)]
pub struct AlarmScheduler {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    pool: SqlitePool,
    class_name: String,
    namespace: Weak<NamespaceInner>,
    timers: StdMutex<HashMap<String, JoinHandle<()>>>,
}

impl AlarmScheduler {
    pub(crate) fn new(pool: SqlitePool, class_name: String, namespace: Weak<NamespaceInner>) -> Self {
        Self {
            inner: Arc::new(AlarmInner {
                pool,
                class_name,
                namespace,
                timers: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist and arm an alarm at `scheduled_at` (epoch ms). Replaces any
    /// existing alarm for the instance.
    pub async fn set(&self, instance_id: &str, scheduled_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO do_alarms (namespace, instance_id, scheduled_at) VALUES (?, ?, ?)
             ON CONFLICT(namespace, instance_id) DO UPDATE SET scheduled_at = excluded.scheduled_at",
        )
        .bind(&self.inner.class_name)
        .bind(instance_id)
        .bind(scheduled_at)
        .execute(&self.inner.pool)
        .await?;
        self.arm(instance_id.to_string(), scheduled_at);
        Ok(())
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT scheduled_at FROM do_alarms WHERE namespace = ? AND instance_id = ?",
        )
        .bind(&self.inner.class_name)
        .bind(instance_id)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(row.map(|(at,)| at))
    }

    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM do_alarms WHERE namespace = ? AND instance_id = ?")
            .bind(&self.inner.class_name)
            .bind(instance_id)
            .execute(&self.inner.pool)
            .await?;
        if let Some(handle) = self
            .inner
            .timers
            .lock()
            .expect("timer lock")
            .remove(instance_id)
        {
            handle.abort();
        }
        Ok(())
    }

    /// Re-arm every persisted alarm. Past-due alarms fire immediately.
    pub async fn restore(&self) -> Result<()> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT instance_id, scheduled_at FROM do_alarms WHERE namespace = ?")
                .bind(&self.inner.class_name)
                .fetch_all(&self.inner.pool)
                .await?;
        for (instance_id, scheduled_at) in rows {
            self.arm(instance_id, scheduled_at);
        }
        Ok(())
    }

    /// Cancel all timers (generation retirement).
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().expect("timer lock");
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    fn arm(&self, instance_id: String, scheduled_at: i64) {
        let inner = Arc::clone(&self.inner);
        let mut timers = self.inner.timers.lock().expect("timer lock");
        if let Some(previous) = timers.remove(&instance_id) {
            previous.abort();
        }
        let key = instance_id.clone();
        let handle = tokio::spawn(async move {
            let wait = (scheduled_at - now_ms()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(wait)).await;
            fire(inner, instance_id).await;
        });
        timers.insert(key, handle);
    }
}

/// Run the alarm handler with the retry ladder. The row is deleted before
/// each attempt and re-persisted when the attempt fails, so `getAlarm`
/// inside a succeeding handler sees null and a restart resumes retries.
async fn fire(inner: Arc<AlarmInner>, instance_id: String) {
    let mut retry_count: u32 = 0;
    loop {
        if let Err(e) = delete_row(&inner, &instance_id).await {
            warn!(err = %e, "failed to clear alarm row");
        }
        let Some(namespace) = inner.namespace.upgrade() else {
            return; // Generation retired while the timer was pending.
        };
        let info = AlarmInfo {
            retry_count,
            is_retry: retry_count > 0,
        };
        match namespace.fire_alarm(&instance_id, info).await {
            Ok(()) => return,
            Err(e) => {
                if retry_count as usize >= BACKOFF_SECS.len() {
                    warn!(instance = %instance_id, err = %e, "alarm handler failed after final retry; discarding");
                    return;
                }
                let delay = Duration::from_secs(BACKOFF_SECS[retry_count as usize]);
                warn!(
                    instance = %instance_id,
                    retry = retry_count,
                    delay_s = delay.as_secs(),
                    err = %e,
                    "alarm handler failed; rescheduling"
                );
                // Re-persist so a restart inherits the pending retry.
                let next_at = now_ms() + delay.as_millis() as i64;
                if let Err(e) = persist_row(&inner, &instance_id, next_at).await {
                    warn!(err = %e, "failed to re-persist alarm row");
                }
                drop(namespace);
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
        }
    }
}

async fn delete_row(inner: &AlarmInner, instance_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM do_alarms WHERE namespace = ? AND instance_id = ?")
        .bind(&inner.class_name)
        .bind(instance_id)
        .execute(&inner.pool)
        .await?;
    Ok(())
}

async fn persist_row(inner: &AlarmInner, instance_id: &str, scheduled_at: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO do_alarms (namespace, instance_id, scheduled_at) VALUES (?, ?, ?)
         ON CONFLICT(namespace, instance_id) DO UPDATE SET scheduled_at = excluded.scheduled_at",
    )
    .bind(&inner.class_name)
    .bind(instance_id)
    .bind(scheduled_at)
    .execute(&inner.pool)
    .await?;
    Ok(())
}
