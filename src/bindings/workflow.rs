//! Workflow binding: long-running, step-addressable procedures with durable
//! step memoization, pause/resume, terminate, and restart.
//!
//! Execution state lives in `workflow_instances`; step outputs in
//! `workflow_steps`. A step result is immutable once memoized — re-running
//! the instance returns the stored output without invoking the callback,
//! which is what makes `restart` resume where it left off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::bindings::Env;
use crate::storage::now_ms;
use crate::trace::BindingTracer;
use crate::worker::WorkflowFactory;

/// Development-mode sleeps are shortened to keep local runs fast.
const DEV_SLEEP_CAP: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Paused,
    Complete,
    Errored,
    Terminated,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Errored => "errored",
            WorkflowStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => WorkflowStatus::Paused,
            "complete" => WorkflowStatus::Complete,
            "errored" => WorkflowStatus::Errored,
            "terminated" => WorkflowStatus::Terminated,
            _ => WorkflowStatus::Running,
        }
    }
}

/// Event handed to `run`: the instance id plus its creation params.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub instance_id: String,
    pub payload: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct WorkflowInstanceStatus {
    pub status: WorkflowStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowCreateOptions {
    pub id: Option<String>,
    pub params: Option<Value>,
}

// ─── Step handle ──────────────────────────────────────────────────────────────

/// The `step` argument to `run`. Checks the abort signal at every
/// checkpoint, which is how `terminate`/`restart` interrupt an execution.
#[derive(Clone)]
pub struct WorkflowStep {
    pool: SqlitePool,
    instance_id: String,
    abort: watch::Receiver<bool>,
}

impl WorkflowStep {
    /// Run (or recall) a named step. A memoized `(instance, name)` output is
    /// returned without invoking `cb`.
    pub async fn r#do<F, Fut>(&self, name: &str, cb: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        self.checkpoint().await?;

        let memoized: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT output FROM workflow_steps WHERE instance_id = ? AND step_name = ?",
        )
        .bind(&self.instance_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((output,)) = memoized {
            return Ok(output
                .map(|o| serde_json::from_str(&o))
                .transpose()?
                .unwrap_or(Value::Null));
        }

        let value = cb().await?;
        sqlx::query(
            "INSERT INTO workflow_steps (instance_id, step_name, output, completed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(instance_id, step_name) DO NOTHING",
        )
        .bind(&self.instance_id)
        .bind(name)
        .bind(serde_json::to_string(&value)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(value)
    }

    /// Named pause. Sleeps briefly in development mode; the name is accepted
    /// but not memoized.
    pub async fn sleep(&self, _name: &str, duration: Duration) -> Result<()> {
        self.checkpoint().await?;
        tokio::time::sleep(duration.min(DEV_SLEEP_CAP)).await;
        self.checkpoint().await
    }

    /// Abort check plus pause gate: a paused instance holds here until
    /// resumed or terminated.
    async fn checkpoint(&self) -> Result<()> {
        loop {
            if *self.abort.borrow() {
                return Err(anyhow!("workflow terminated"));
            }
            let (status,): (String,) =
                sqlx::query_as("SELECT status FROM workflow_instances WHERE id = ?")
                    .bind(&self.instance_id)
                    .fetch_one(&self.pool)
                    .await?;
            if WorkflowStatus::parse(&status) != WorkflowStatus::Paused {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// ─── Binding ──────────────────────────────────────────────────────────────────

struct Execution {
    abort: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct WorkflowInner {
    pool: SqlitePool,
    workflow_name: String,
    class_name: String,
    tracer: BindingTracer,
    factory: StdRwLock<Option<Arc<dyn WorkflowFactory>>>,
    env: StdRwLock<Option<Env>>,
    executions: StdMutex<HashMap<String, Execution>>,
}

#[derive(Clone)]
pub struct WorkflowBinding {
    inner: Arc<WorkflowInner>,
}

impl WorkflowBinding {
    pub fn new(
        pool: SqlitePool,
        workflow_name: impl Into<String>,
        class_name: impl Into<String>,
        tracer: BindingTracer,
    ) -> Self {
        Self {
            inner: Arc::new(WorkflowInner {
                pool,
                workflow_name: workflow_name.into(),
                class_name: class_name.into(),
                tracer,
                factory: StdRwLock::new(None),
                env: StdRwLock::new(None),
                executions: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow_name
    }

    pub fn wire(&self, factory: Arc<dyn WorkflowFactory>, env: Env) {
        *self.inner.factory.write().expect("factory lock") = Some(factory);
        *self.inner.env.write().expect("env lock") = Some(env);
    }

    /// Mark rows left `running` by a dead host as errored. Memoized steps
    /// are preserved; the operator resumes with `restart`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let n = sqlx::query(
            "UPDATE workflow_instances SET status = 'errored', error = 'interrupted by restart', updated_at = ?
             WHERE workflow_name = ? AND status = 'running'",
        )
        .bind(now_ms())
        .bind(&self.inner.workflow_name)
        .execute(&self.inner.pool)
        .await?
        .rows_affected();
        Ok(n)
    }

    /// Abort live executions and drop wiring (generation retirement).
    pub fn retire(&self) {
        let mut executions = self.inner.executions.lock().expect("executions lock");
        for (_, execution) in executions.drain() {
            let _ = execution.abort.send(true);
            execution.task.abort();
        }
        *self.inner.factory.write().expect("factory lock") = None;
        *self.inner.env.write().expect("env lock") = None;
    }

    pub async fn create(&self, opts: WorkflowCreateOptions) -> Result<WorkflowInstanceHandle> {
        let _span = self.inner.tracer.span("create", opts.id.as_deref());
        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let params = opts.params.unwrap_or(Value::Null);
        let now = now_ms();
        sqlx::query(
            "INSERT INTO workflow_instances (id, workflow_name, class_name, params, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'running', ?, ?)",
        )
        .bind(&id)
        .bind(&self.inner.workflow_name)
        .bind(&self.inner.class_name)
        .bind(serde_json::to_string(&params)?)
        .bind(now)
        .bind(now)
        .execute(&self.inner.pool)
        .await?;
        self.record_event(&id, "created", None).await?;
        self.spawn_execution(id.clone(), params)?;
        Ok(WorkflowInstanceHandle {
            binding: self.clone(),
            id,
        })
    }

    pub async fn get(&self, id: &str) -> Result<WorkflowInstanceHandle> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM workflow_instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.inner.pool)
                .await?;
        match row {
            Some(_) => Ok(WorkflowInstanceHandle {
                binding: self.clone(),
                id: id.to_string(),
            }),
            None => Err(anyhow!("no workflow instance '{id}'")),
        }
    }

    fn spawn_execution(&self, id: String, params: Value) -> Result<()> {
        let factory = self
            .inner
            .factory
            .read()
            .expect("factory lock")
            .clone()
            .ok_or_else(|| anyhow!("workflow class '{}' is not wired", self.inner.class_name))?;
        let env = self
            .inner
            .env
            .read()
            .expect("env lock")
            .clone()
            .ok_or_else(|| anyhow!("workflow binding has no env"))?;

        let (abort_tx, abort_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let entrypoint = factory.construct(env);
            let event = WorkflowEvent {
                instance_id: task_id.clone(),
                payload: params,
                timestamp: now_ms(),
            };
            let step = WorkflowStep {
                pool: inner.pool.clone(),
                instance_id: task_id.clone(),
                abort: abort_rx,
            };
            let result = entrypoint.run(event, step).await;
            let outcome = match &result {
                Ok(output) => {
                    finish(&inner, &task_id, "complete", Some(output), None).await
                }
                Err(e) => {
                    // A terminate/restart abort already flipped the row; the
                    // conditional update below is a no-op in that case.
                    finish(&inner, &task_id, "errored", None, Some(&e.to_string())).await
                }
            };
            if let Err(e) = outcome {
                warn!(instance = %task_id, err = %e, "failed to record workflow outcome");
            }
            inner.executions.lock().expect("executions lock").remove(&task_id);
        });
        self.inner.executions.lock().expect("executions lock").insert(
            id,
            Execution {
                abort: abort_tx,
                task,
            },
        );
        Ok(())
    }

    async fn record_event(&self, id: &str, event: &str, detail: Option<&str>) -> Result<()> {
        record_event_in(&self.inner.pool, id, event, detail).await
    }
}

/// Terminal-state update, guarded so `terminate` wins over a late finish.
async fn finish(
    inner: &WorkflowInner,
    id: &str,
    status: &str,
    output: Option<&Value>,
    error: Option<&str>,
) -> Result<()> {
    let affected = sqlx::query(
        "UPDATE workflow_instances SET status = ?, output = ?, error = ?, updated_at = ?
         WHERE id = ? AND status IN ('running', 'paused')",
    )
    .bind(status)
    .bind(output.map(serde_json::to_string).transpose()?)
    .bind(error)
    .bind(now_ms())
    .bind(id)
    .execute(&inner.pool)
    .await?
    .rows_affected();
    if affected > 0 {
        record_event_in(&inner.pool, id, status, error).await?;
    }
    Ok(())
}

async fn record_event_in(
    pool: &SqlitePool,
    id: &str,
    event: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_events (instance_id, event, detail, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(event)
    .bind(detail)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

// ─── Instance handle ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorkflowInstanceHandle {
    binding: WorkflowBinding,
    pub id: String,
}

impl WorkflowInstanceHandle {
    pub async fn status(&self) -> Result<WorkflowInstanceStatus> {
        let (status, output, error): (String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT status, output, error FROM workflow_instances WHERE id = ?",
        )
        .bind(&self.id)
        .fetch_one(&self.binding.inner.pool)
        .await?;
        Ok(WorkflowInstanceStatus {
            status: WorkflowStatus::parse(&status),
            output: output.map(|o| serde_json::from_str(&o)).transpose()?,
            error,
        })
    }

    pub async fn pause(&self) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_instances SET status = 'paused', updated_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(now_ms())
        .bind(&self.id)
        .execute(&self.binding.inner.pool)
        .await?;
        self.binding.record_event(&self.id, "paused", None).await
    }

    pub async fn resume(&self) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_instances SET status = 'running', updated_at = ? WHERE id = ? AND status = 'paused'",
        )
        .bind(now_ms())
        .bind(&self.id)
        .execute(&self.binding.inner.pool)
        .await?;
        self.binding.record_event(&self.id, "resumed", None).await
    }

    /// Flip the row and abort the running execution at its next checkpoint.
    pub async fn terminate(&self) -> Result<()> {
        sqlx::query(
            "UPDATE workflow_instances SET status = 'terminated', updated_at = ?
             WHERE id = ? AND status IN ('running', 'paused')",
        )
        .bind(now_ms())
        .bind(&self.id)
        .execute(&self.binding.inner.pool)
        .await?;
        if let Some(execution) = self
            .binding
            .inner
            .executions
            .lock()
            .expect("executions lock")
            .get(&self.id)
        {
            let _ = execution.abort.send(true);
        }
        self.binding.record_event(&self.id, "terminated", None).await
    }

    /// Abort the current execution, clear output/error, keep memoized steps,
    /// and re-run from the top — completed steps replay from the memo table.
    pub async fn restart(&self) -> Result<()> {
        if let Some(execution) = self
            .binding
            .inner
            .executions
            .lock()
            .expect("executions lock")
            .remove(&self.id)
        {
            let _ = execution.abort.send(true);
            execution.task.abort();
        }
        let (params,): (Option<String>,) =
            sqlx::query_as("SELECT params FROM workflow_instances WHERE id = ?")
                .bind(&self.id)
                .fetch_one(&self.binding.inner.pool)
                .await?;
        sqlx::query(
            "UPDATE workflow_instances SET status = 'running', output = NULL, error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now_ms())
        .bind(&self.id)
        .execute(&self.binding.inner.pool)
        .await?;
        self.binding.record_event(&self.id, "restarted", None).await?;
        let params = params
            .map(|p| serde_json::from_str(&p))
            .transpose()?
            .unwrap_or(Value::Null);
        self.binding.spawn_execution(self.id.clone(), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::worker::WorkflowEntrypoint;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts callback invocations so memoization is observable.
    struct TwoStep {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkflowEntrypoint for TwoStep {
        async fn run(&self, _event: WorkflowEvent, step: WorkflowStep) -> Result<Value> {
            let calls = Arc::clone(&self.calls);
            let first = step
                .r#do("first", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(21))
                })
                .await?;
            let double = step
                .r#do("double", || async move {
                    Ok(json!(first.as_i64().unwrap() * 2))
                })
                .await?;
            Ok(json!({"answer": double}))
        }
    }

    struct TwoStepFactory {
        calls: Arc<AtomicUsize>,
    }

    impl WorkflowFactory for TwoStepFactory {
        fn construct(&self, _env: Env) -> Arc<dyn WorkflowEntrypoint> {
            Arc::new(TwoStep {
                calls: Arc::clone(&self.calls),
            })
        }
    }

    async fn binding(dir: &std::path::Path, calls: Arc<AtomicUsize>) -> WorkflowBinding {
        let storage = Storage::open(dir).await.unwrap();
        let binding = WorkflowBinding::new(
            storage.pool(),
            "orders",
            "OrderWorkflow",
            BindingTracer::disabled("workflow"),
        );
        binding.wire(Arc::new(TwoStepFactory { calls }), Env::empty());
        binding
    }

    async fn wait_status(
        handle: &WorkflowInstanceHandle,
        want: WorkflowStatus,
    ) -> WorkflowInstanceStatus {
        for _ in 0..100 {
            let status = handle.status().await.unwrap();
            if status.status == want {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow never reached {:?}", want);
    }

    #[tokio::test]
    async fn create_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let b = binding(dir.path(), Arc::clone(&calls)).await;
        let handle = b.create(WorkflowCreateOptions::default()).await.unwrap();
        let status = wait_status(&handle, WorkflowStatus::Complete).await;
        assert_eq!(status.output, Some(json!({"answer": 42})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_reuses_memoized_steps() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let b = binding(dir.path(), Arc::clone(&calls)).await;
        let handle = b.create(WorkflowCreateOptions::default()).await.unwrap();
        wait_status(&handle, WorkflowStatus::Complete).await;

        handle.restart().await.unwrap();
        let status = wait_status(&handle, WorkflowStatus::Complete).await;
        assert_eq!(status.output, Some(json!({"answer": 42})));
        // The memoized "first" step did not run its callback again.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recover_interrupted_marks_running_rows() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let b = binding(dir.path(), calls).await;
        // Simulate a row left behind by a dead process.
        sqlx::query(
            "INSERT INTO workflow_instances (id, workflow_name, class_name, status, created_at, updated_at)
             VALUES ('stale', 'orders', 'OrderWorkflow', 'running', 0, 0)",
        )
        .execute(&b.inner.pool)
        .await
        .unwrap();
        assert_eq!(b.recover_interrupted().await.unwrap(), 1);
        let handle = b.get("stale").await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Errored);
        assert_eq!(status.error.as_deref(), Some("interrupted by restart"));
    }

    struct Slow;

    #[async_trait]
    impl WorkflowEntrypoint for Slow {
        async fn run(&self, _event: WorkflowEvent, step: WorkflowStep) -> Result<Value> {
            for i in 0..50 {
                step.r#do(&format!("step-{i}"), || async move { Ok(json!(i)) })
                    .await?;
                step.sleep("pace", Duration::from_millis(30)).await?;
            }
            Ok(json!("done"))
        }
    }

    struct SlowFactory;
    impl WorkflowFactory for SlowFactory {
        fn construct(&self, _env: Env) -> Arc<dyn WorkflowEntrypoint> {
            Arc::new(Slow)
        }
    }

    #[tokio::test]
    async fn terminate_aborts_at_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let b = WorkflowBinding::new(
            storage.pool(),
            "slow",
            "Slow",
            BindingTracer::disabled("workflow"),
        );
        b.wire(Arc::new(SlowFactory), Env::empty());
        let handle = b.create(WorkflowCreateOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.terminate().await.unwrap();
        let status = wait_status(&handle, WorkflowStatus::Terminated).await;
        assert!(status.output.is_none());
    }

    #[tokio::test]
    async fn errored_step_preserves_memoized_prefix() {
        struct FailSecond;

        #[async_trait]
        impl WorkflowEntrypoint for FailSecond {
            async fn run(&self, _event: WorkflowEvent, step: WorkflowStep) -> Result<Value> {
                step.r#do("ok", || async { Ok(json!("kept")) }).await?;
                step.r#do("boom", || async { Err(anyhow!("step failed")) })
                    .await?;
                Ok(Value::Null)
            }
        }
        struct FailFactory;
        impl WorkflowFactory for FailFactory {
            fn construct(&self, _env: Env) -> Arc<dyn WorkflowEntrypoint> {
                Arc::new(FailSecond)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let b = WorkflowBinding::new(
            storage.pool(),
            "flaky",
            "FailSecond",
            BindingTracer::disabled("workflow"),
        );
        b.wire(Arc::new(FailFactory), Env::empty());
        let handle = b.create(WorkflowCreateOptions::default()).await.unwrap();
        let status = wait_status(&handle, WorkflowStatus::Errored).await;
        assert_eq!(status.error.as_deref(), Some("step failed"));

        let (output,): (Option<String>,) = sqlx::query_as(
            "SELECT output FROM workflow_steps WHERE instance_id = ? AND step_name = 'ok'",
        )
        .bind(&handle.id)
        .fetch_one(&b.inner.pool)
        .await
        .unwrap();
        assert_eq!(output.as_deref(), Some("\"kept\""));
    }
}
