//! End-to-end scenarios against a fully built generation: a worker module
//! with fetch/scheduled/queue entrypoints, a Durable Object class, and a
//! service entrypoint, wired through the dispatch core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use bunflare::bindings::durable::DoState;
use bunflare::bindings::kv::{KvListOptions, KvPutOptions, KvType};
use bunflare::bindings::queue::{MessageBatch, QueueBody, QueueSendOptions};
use bunflare::bindings::r2::{R2GetOptions, R2PutOptions};
use bunflare::bindings::Env;
use bunflare::config::{RawConfig, WorkerConfig};
use bunflare::context::ExecutionContext;
use bunflare::generation::GenerationManager;
use bunflare::http_types::{WorkerRequest, WorkerResponse};
use bunflare::storage::{now_ms, Storage};
use bunflare::trace::LogSink;
use bunflare::worker::{
    AlarmInfo, DurableObject, DurableObjectFactory, Export, HandlerSet, ModuleLoader,
    ScheduledController, ServiceEntrypoint, ServiceEntrypointFactory, Worker, WorkerModule,
};

// ─── Test worker module ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    scheduled_runs: AtomicUsize,
    queue_batches: AtomicUsize,
    alarm_attempts: AtomicUsize,
    alarm_successes: AtomicUsize,
}

struct TestWorker {
    counters: Arc<Counters>,
}

#[async_trait]
impl Worker for TestWorker {
    async fn fetch(
        &self,
        req: WorkerRequest,
        env: Env,
        _ctx: ExecutionContext,
    ) -> Result<WorkerResponse> {
        match req.path() {
            "/enqueue" => {
                env.queue("JOBS")?
                    .send(QueueBody::Text(req.text()), QueueSendOptions::default())
                    .await?;
                Ok(WorkerResponse::ok("queued"))
            }
            _ => Ok(WorkerResponse::ok("hello from the worker")),
        }
    }

    async fn scheduled(
        &self,
        controller: ScheduledController,
        _env: Env,
        _ctx: ExecutionContext,
    ) -> Result<()> {
        assert!(!controller.cron.is_empty());
        self.counters.scheduled_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn queue(&self, batch: &MessageBatch, _env: Env, _ctx: ExecutionContext) -> Result<()> {
        self.counters.queue_batches.fetch_add(1, Ordering::SeqCst);
        // Every delivery asks for a retry; exhaustion lands in the DLQ.
        batch.retry_all(None);
        Ok(())
    }
}

/// DO whose alarm fails on the first attempt and succeeds on the retry.
struct FlakyAlarm {
    state: DoState,
    counters: Arc<Counters>,
}

#[async_trait]
impl DurableObject for FlakyAlarm {
    async fn call(&self, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        match method {
            "arm" => {
                let delay = args[0].as_i64().unwrap_or(100);
                self.state.storage().set_alarm(now_ms() + delay).await?;
                Ok(json!("armed"))
            }
            "alarm_state" => {
                let pending = self.state.storage().get_alarm().await?;
                Ok(json!({
                    "pending": pending,
                    "attempts": self.counters.alarm_attempts.load(Ordering::SeqCst),
                    "successes": self.counters.alarm_successes.load(Ordering::SeqCst),
                }))
            }
            other => Err(anyhow!("no method {other}")),
        }
    }

    async fn alarm(&self, info: AlarmInfo) -> Result<()> {
        let attempt = self.counters.alarm_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            assert!(!info.is_retry);
            return Err(anyhow!("first attempt fails"));
        }
        assert!(info.is_retry);
        self.counters.alarm_successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlakyAlarmFactory {
    counters: Arc<Counters>,
}

impl DurableObjectFactory for FlakyAlarmFactory {
    fn construct(&self, state: DoState, _env: Env) -> Arc<dyn DurableObject> {
        Arc::new(FlakyAlarm {
            state,
            counters: Arc::clone(&self.counters),
        })
    }
}

struct Adder;

#[async_trait]
impl ServiceEntrypoint for Adder {
    async fn call(&self, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        match method {
            "add" => Ok(json!(
                args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)
            )),
            other => Err(anyhow!("entrypoint has no method '{other}'")),
        }
    }
}

struct AdderFactory;
impl ServiceEntrypointFactory for AdderFactory {
    fn construct(&self, _env: Env) -> Arc<dyn ServiceEntrypoint> {
        Arc::new(Adder)
    }
}

struct TestLoader {
    counters: Arc<Counters>,
}

#[async_trait]
impl ModuleLoader for TestLoader {
    async fn load(&self, _config: &WorkerConfig) -> Result<WorkerModule> {
        Ok(WorkerModule::new(
            Arc::new(TestWorker {
                counters: Arc::clone(&self.counters),
            }),
            HandlerSet {
                fetch: true,
                scheduled: true,
                queue: true,
            },
        )
        .export(
            "FlakyAlarm",
            Export::DurableObject(Arc::new(FlakyAlarmFactory {
                counters: Arc::clone(&self.counters),
            })),
        )
        .export("Adder", Export::Entrypoint(Arc::new(AdderFactory))))
    }
}

fn full_config() -> WorkerConfig {
    let raw: RawConfig = serde_json::from_value(json!({
        "name": "integration-worker",
        "main": "src/index.ts",
        "vars": {"MODE": "test"},
        "kv_namespaces": [{"binding": "KV", "id": "kv-integration"}],
        "r2_buckets": [{"binding": "BUCKET", "bucket_name": "media"}],
        "durable_objects": {"bindings": [{"name": "ALARMS", "class_name": "FlakyAlarm"}]},
        "queues": {
            "producers": [{"binding": "JOBS", "queue": "test-queue"}],
            "consumers": [{"queue": "test-queue", "max_retries": 2, "dead_letter_queue": "dlq"}]
        },
        "services": [
            {"binding": "SELF", "service": "integration-worker"},
            {"binding": "MATH", "service": "integration-worker", "entrypoint": "Adder"}
        ],
    }))
    .unwrap();
    WorkerConfig::from_raw(raw, None).unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    manager: Arc<GenerationManager>,
    storage: Arc<Storage>,
    counters: Arc<Counters>,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(dir.path()).await.unwrap());
    let counters = Arc::new(Counters::default());
    let manager = Arc::new(GenerationManager::new(
        dir.path().join("wrangler.jsonc"),
        Arc::clone(&storage),
        Arc::new(TestLoader {
            counters: Arc::clone(&counters),
        }),
        Arc::new(LogSink),
    ));
    manager.reload_with(full_config()).await.unwrap();
    Harness {
        _dir: dir,
        manager,
        storage,
        counters,
    }
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn kv_ttl_expiry() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();
    let kv = generation.env.kv("KV").unwrap();

    kv.put(
        "k",
        b"v",
        KvPutOptions {
            expiration_ttl: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(kv.get("k", KvType::Text).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(kv.get("k", KvType::Text).await.unwrap().is_none());
    let listing = kv.list(KvListOptions::default()).await.unwrap();
    assert!(listing.keys.iter().all(|key| key.name != "k"));
}

#[tokio::test]
async fn r2_multipart_assembles_ten_mib() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();
    let bucket = generation.env.r2("BUCKET").unwrap();

    let upload = bucket
        .create_multipart_upload("big.bin", R2PutOptions::default())
        .await
        .unwrap();
    let part1 = upload
        .upload_part(1, vec![b'a'; 5 * 1024 * 1024])
        .await
        .unwrap();
    let part2 = upload
        .upload_part(2, vec![b'b'; 5 * 1024 * 1024])
        .await
        .unwrap();
    let object = upload.complete(vec![part1, part2]).await.unwrap();
    assert_eq!(object.size, 10 * 1024 * 1024);

    let got = bucket
        .get("big.bin", R2GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    let body = got.body().unwrap();
    assert_eq!(body.len(), 10 * 1024 * 1024);
    assert!(body[..5 * 1024 * 1024].iter().all(|&b| b == b'a'));
    assert!(body[5 * 1024 * 1024..].iter().all(|&b| b == b'b'));
}

#[tokio::test]
async fn queue_retry_exhaustion_moves_to_dlq() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();

    // Enqueue through the worker's own fetch path.
    let mut req = WorkerRequest::get("http://localhost/enqueue");
    req.body = bytes::Bytes::from_static(b"x");
    let resp = generation.fetch(req).await;
    assert_eq!(resp.status, http::StatusCode::OK);

    // The push consumer polls every second; two deliveries exhaust
    // max_retries = 2 and move the message to the DLQ.
    let pool = harness.storage.pool();
    let mut in_dlq = 0i64;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (dlq,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = 'dlq'")
                .fetch_one(&pool)
                .await
                .unwrap();
        if dlq > 0 {
            in_dlq = dlq;
            break;
        }
    }
    assert_eq!(in_dlq, 1, "message should land in the DLQ");
    let (remaining,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = 'test-queue'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(remaining, 0);
    assert!(harness.counters.queue_batches.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn do_alarm_retries_with_backoff_then_clears() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();
    let namespace = generation.env.durable_object("ALARMS").unwrap();
    let stub = namespace.get_by_name("ticker");

    stub.call("arm", vec![json!(100)]).await.unwrap();

    // Fire at +100 ms, fail, retry after the 1 s backoff, succeed.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let state = stub.call("alarm_state", vec![]).await.unwrap();
    assert_eq!(state["attempts"], json!(2));
    assert_eq!(state["successes"], json!(1));
    assert_eq!(state["pending"], json!(null));
}

#[tokio::test]
async fn service_binding_http_and_rpc_modes() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();

    let plain = generation.env.service("SELF").unwrap();
    assert!(plain.is_wired());
    let resp = plain
        .fetch(WorkerRequest::get("http://svc/anything"))
        .await
        .unwrap();
    assert_eq!(
        resp.bytes().await.unwrap().as_ref(),
        b"hello from the worker"
    );

    let math = generation.env.service("MATH").unwrap();
    let sum = math.call("add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, json!(5));
}

#[tokio::test]
async fn manual_scheduled_dispatch() {
    let harness = start().await;
    let generation = harness.manager.active().unwrap();
    assert!(generation.has_scheduled_handler());
    generation.scheduled("*/5 * * * *", now_ms()).await.unwrap();
    assert_eq!(harness.counters.scheduled_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reload_swaps_while_old_generation_drains() {
    let harness = start().await;
    let first = harness.manager.active().unwrap();
    harness.manager.reload_with(full_config()).await.unwrap();
    let second = harness.manager.active().unwrap();
    assert!(second.id > first.id);

    // A caller holding the old generation still completes against it.
    let resp = first.fetch(WorkerRequest::get("http://localhost/")).await;
    assert_eq!(resp.status, http::StatusCode::OK);

    // Persistent state crosses generations through the substrate.
    let kv = second.env.kv("KV").unwrap();
    kv.put("persisted", b"yes", KvPutOptions::default())
        .await
        .unwrap();
    harness.manager.reload_with(full_config()).await.unwrap();
    let third = harness.manager.active().unwrap();
    let value = third
        .env
        .kv("KV")
        .unwrap()
        .get("persisted", KvType::Text)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value.as_text(), Some("yes"));
}
