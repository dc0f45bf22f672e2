//! Durable Objects: per-identity actors with serialized access, persistent
//! storage, alarms, per-instance SQL, and WebSocket hibernation.
//!
//! The stub is modelled as a handle onto a per-instance cell: every
//! forwarded call first awaits the instance's readiness gate (replaced by
//! `block_concurrency_while`), then takes the per-instance call lock, so
//! external callers queue and complete in arrival order.

pub mod alarm;
pub mod sql;
pub mod storage;
pub mod websocket;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::bindings::container::ContainerRuntime;
use crate::bindings::Env;
use crate::http_types::{WorkerRequest, WorkerResponse};
use crate::storage::now_ms;
use crate::trace::BindingTracer;
use crate::worker::{AlarmInfo, DurableObject, DurableObjectFactory};

use self::alarm::AlarmScheduler;
use self::sql::SqlStorage;
use self::storage::DoStorage;
use self::websocket::{WebSocketHandle, WebSocketRegistry, WsMessage};

// ─── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DoId {
    id: String,
    name: Option<String>,
}

impl DoId {
    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl std::fmt::Display for DoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

// ─── Readiness gate ───────────────────────────────────────────────────────────

/// The readiness gate shared by a stub and its instance. Forwarded calls
/// wait until no `block_concurrency_while` callback is outstanding; a new
/// callback replaces the gate all pending calls wait on.
#[derive(Clone, Default)]
pub struct ReadyGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    blocked: AtomicU32,
    notify: Notify,
}

impl ReadyGate {
    pub fn begin(&self) {
        self.inner.blocked.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end(&self) {
        if self.inner.blocked.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub async fn wait_ready(&self) {
        loop {
            if self.inner.blocked.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.inner.blocked.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ─── Instance state ───────────────────────────────────────────────────────────

/// State shared between the namespace, the stub, and the user object.
/// The user object never holds the cell (which holds the object), so there
/// is no ownership cycle.
pub struct InstanceShared {
    pub id: DoId,
    class_name: String,
    pool: SqlitePool,
    sql_path: PathBuf,
    sql_pool: tokio::sync::OnceCell<SqlitePool>,
    gate: ReadyGate,
    sockets: WebSocketRegistry,
    alarms: AlarmScheduler,
    container: StdRwLock<Option<Arc<ContainerRuntime>>>,
}

/// The `state` object a Durable Object class is constructed with.
#[derive(Clone)]
pub struct DoState {
    shared: Arc<InstanceShared>,
}

impl DoState {
    pub fn id(&self) -> &DoId {
        &self.shared.id
    }

    pub fn storage(&self) -> DoStorage {
        DoStorage::new(
            self.shared.pool.clone(),
            self.shared.class_name.clone(),
            self.shared.id.as_str().to_string(),
            self.shared.alarms.clone(),
        )
    }

    /// Lazily opened per-instance SQL database.
    pub async fn sql(&self) -> Result<SqlStorage> {
        let pool = self
            .shared
            .sql_pool
            .get_or_try_init(|| async {
                SqlStorage::open_pool(&self.shared.sql_path).await
            })
            .await?;
        Ok(SqlStorage::new(pool.clone()))
    }

    /// Gate the instance until `fut` resolves: calls forwarded through the
    /// stub wait on the latest outstanding callback. The future starts
    /// immediately, like a promise would.
    pub fn block_concurrency_while<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let gate = self.shared.gate.clone();
        gate.begin();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(err = %e, "blockConcurrencyWhile callback failed");
            }
            gate.end();
        });
    }

    /// Background work starts immediately when the future is created in the
    /// source platform, so spawning preserves the observable behavior.
    pub fn wait_until<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
    }

    // ── WebSocket hibernation ─────────────────────────────────────────────

    pub fn accept_web_socket(&self, ws: WebSocketHandle, tags: Vec<String>) {
        self.shared.sockets.accept(ws, tags);
    }

    pub fn get_web_sockets(&self, tag: Option<&str>) -> Vec<WebSocketHandle> {
        self.shared.sockets.get(tag)
    }

    pub fn set_web_socket_auto_response(&self, pair: Option<(String, String)>) {
        self.shared.sockets.set_auto_response(pair);
    }

    pub fn get_web_socket_auto_response(&self) -> Option<(String, String)> {
        self.shared.sockets.auto_response()
    }

    /// The Docker runtime for container-enabled classes.
    pub fn container(&self) -> Option<Arc<ContainerRuntime>> {
        self.shared.container.read().expect("container lock").clone()
    }
}

/// One live instance: the cell owns the constructed object plus the locks
/// that serialize access to it.
pub struct InstanceCell {
    object: tokio::sync::OnceCell<Arc<dyn DurableObject>>,
    call_lock: tokio::sync::Mutex<()>,
    pub shared: Arc<InstanceShared>,
}

// ─── Namespace ────────────────────────────────────────────────────────────────

pub struct NamespaceInner {
    class_name: String,
    pool: SqlitePool,
    sql_root: PathBuf,
    tracer: BindingTracer,
    factory: StdRwLock<Option<Arc<dyn DurableObjectFactory>>>,
    env: StdRwLock<Option<Env>>,
    instances: StdMutex<HashMap<String, Arc<InstanceCell>>>,
    alarms: AlarmScheduler,
    container_runtime: StdRwLock<Option<Arc<dyn Fn(&DoId) -> Arc<ContainerRuntime> + Send + Sync>>>,
}

/// The binding handle: `env.MY_DO`.
#[derive(Clone)]
pub struct DoNamespace {
    inner: Arc<NamespaceInner>,
}

impl DoNamespace {
    pub fn new(
        pool: SqlitePool,
        class_name: impl Into<String>,
        sql_root: PathBuf,
        tracer: BindingTracer,
    ) -> Self {
        let class_name = class_name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<NamespaceInner>| NamespaceInner {
            class_name: class_name.clone(),
            pool: pool.clone(),
            sql_root,
            tracer,
            factory: StdRwLock::new(None),
            env: StdRwLock::new(None),
            instances: StdMutex::new(HashMap::new()),
            alarms: AlarmScheduler::new(pool, class_name, weak.clone()),
            container_runtime: StdRwLock::new(None),
        });
        Self { inner }
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// Late-bind the exported class and env. Called at generation wiring
    /// time, before any request can reach the namespace.
    pub fn wire(&self, factory: Arc<dyn DurableObjectFactory>, env: Env) {
        *self.inner.factory.write().expect("factory lock") = Some(factory);
        *self.inner.env.write().expect("env lock") = Some(env);
    }

    /// Provide a constructor for per-instance container runtimes
    /// (container-enabled classes only).
    pub fn wire_containers(
        &self,
        make: Arc<dyn Fn(&DoId) -> Arc<ContainerRuntime> + Send + Sync>,
    ) {
        *self.inner.container_runtime.write().expect("container lock") = Some(make);
    }

    /// Re-arm persisted alarms. Called once per generation after wiring.
    pub async fn restore_alarms(&self) -> Result<()> {
        self.inner.alarms.restore().await
    }

    /// Drop wiring and cancel alarm timers; breaks the env ↔ namespace
    /// reference cycle when a generation retires.
    pub fn retire(&self) {
        *self.inner.factory.write().expect("factory lock") = None;
        *self.inner.env.write().expect("env lock") = None;
        self.inner.alarms.shutdown();
        let instances = std::mem::take(&mut *self.inner.instances.lock().expect("instances"));
        drop(instances);
    }

    // ── Identity operations ───────────────────────────────────────────────

    pub fn new_unique_id(&self) -> DoId {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        DoId {
            id: hex::encode(hasher.finalize()),
            name: None,
        }
    }

    /// Deterministic id: SHA-256 of the human name, hex encoded.
    pub fn id_from_name(&self, name: &str) -> DoId {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.class_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(name.as_bytes());
        DoId {
            id: hex::encode(hasher.finalize()),
            name: Some(name.to_string()),
        }
    }

    pub fn id_from_string(&self, id: &str) -> Result<DoId> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("invalid durable object id '{id}'"));
        }
        Ok(DoId {
            id: id.to_ascii_lowercase(),
            name: None,
        })
    }

    pub fn get(&self, id: &DoId) -> DoStub {
        let cell = self.inner.instance(id);
        DoStub {
            cell,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn get_by_name(&self, name: &str) -> DoStub {
        let id = self.id_from_name(name);
        self.get(&id)
    }

    /// Deliver an incoming WebSocket frame for an accepted socket. The
    /// auto-response pair short-circuits the user handler.
    pub async fn deliver_ws_message(
        &self,
        id: &DoId,
        ws: &WebSocketHandle,
        message: WsMessage,
    ) -> Result<()> {
        self.inner.deliver_ws_message(id, ws, message).await
    }

    pub async fn deliver_ws_close(
        &self,
        id: &DoId,
        ws: &WebSocketHandle,
        code: u16,
        reason: String,
        was_clean: bool,
    ) -> Result<()> {
        let cell = self.inner.instance(id);
        let object = self.inner.ensure_object(&cell).await?;
        cell.shared.gate.wait_ready().await;
        let _guard = cell.call_lock.lock().await;
        cell.shared.sockets.remove(ws);
        object.web_socket_close(ws.clone(), code, reason, was_clean).await
    }
}

impl NamespaceInner {
    fn instance(&self, id: &DoId) -> Arc<InstanceCell> {
        let mut instances = self.instances.lock().expect("instances lock");
        if let Some(cell) = instances.get(id.as_str()) {
            return Arc::clone(cell);
        }
        let shared = Arc::new(InstanceShared {
            id: id.clone(),
            class_name: self.class_name.clone(),
            pool: self.pool.clone(),
            sql_path: self.sql_root.join(format!("{}.db", id.as_str())),
            sql_pool: tokio::sync::OnceCell::new(),
            gate: ReadyGate::default(),
            sockets: WebSocketRegistry::default(),
            alarms: self.alarms.clone(),
            container: StdRwLock::new(None),
        });
        if let Some(make) = self
            .container_runtime
            .read()
            .expect("container lock")
            .as_ref()
        {
            *shared.container.write().expect("container lock") = Some(make(id));
        }
        let cell = Arc::new(InstanceCell {
            object: tokio::sync::OnceCell::new(),
            call_lock: tokio::sync::Mutex::new(()),
            shared,
        });
        instances.insert(id.as_str().to_string(), Arc::clone(&cell));
        cell
    }

    /// Construct the user object on first use; records the identity row.
    pub(crate) async fn ensure_object(
        &self,
        cell: &Arc<InstanceCell>,
    ) -> Result<Arc<dyn DurableObject>> {
        cell.object
            .get_or_try_init(|| async {
                sqlx::query(
                    "INSERT OR IGNORE INTO do_instances (class_name, instance_id, name, created_at)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&self.class_name)
                .bind(cell.shared.id.as_str())
                .bind(cell.shared.id.name())
                .bind(now_ms())
                .execute(&self.pool)
                .await?;

                let factory = self
                    .factory
                    .read()
                    .expect("factory lock")
                    .clone()
                    .ok_or_else(|| {
                        anyhow!("durable object class '{}' is not wired", self.class_name)
                    })?;
                let env = self
                    .env
                    .read()
                    .expect("env lock")
                    .clone()
                    .ok_or_else(|| anyhow!("durable object namespace has no env"))?;
                let state = DoState {
                    shared: Arc::clone(&cell.shared),
                };
                Ok(factory.construct(state, env))
            })
            .await
            .cloned()
    }

    /// Alarm dispatch path used by the scheduler timers. The alarm handler
    /// runs behind the same gate and lock as stub calls.
    pub(crate) async fn fire_alarm(&self, instance_id: &str, info: AlarmInfo) -> Result<()> {
        let id = DoId {
            id: instance_id.to_string(),
            name: None,
        };
        let cell = self.instance(&id);
        let object = self.ensure_object(&cell).await?;
        cell.shared.gate.wait_ready().await;
        let _guard = cell.call_lock.lock().await;
        object.alarm(info).await
    }

    async fn deliver_ws_message(
        &self,
        id: &DoId,
        ws: &WebSocketHandle,
        message: WsMessage,
    ) -> Result<()> {
        let cell = self.instance(id);
        if let WsMessage::Text(text) = &message {
            if let Some((request, response)) = cell.shared.sockets.auto_response() {
                if *text == request {
                    ws.send_text(&response);
                    ws.stamp_auto_response(now_ms());
                    return Ok(());
                }
            }
        }
        let object = self.ensure_object(&cell).await?;
        cell.shared.gate.wait_ready().await;
        let _guard = cell.call_lock.lock().await;
        object.web_socket_message(ws.clone(), message).await
    }
}

// ─── Stub ─────────────────────────────────────────────────────────────────────

/// Remote-method handle for one instance. Calls are serialized behind the
/// readiness gate and the per-instance lock.
pub struct DoStub {
    cell: Arc<InstanceCell>,
    inner: Arc<NamespaceInner>,
}

impl DoStub {
    pub fn id(&self) -> &DoId {
        &self.cell.shared.id
    }

    pub async fn fetch(&self, req: WorkerRequest) -> Result<WorkerResponse> {
        let mut span = self.inner.tracer.span("fetch", Some(req.path()));
        let result = self.invoke_fetch(req).await;
        if let Err(ref e) = result {
            span.fail(e);
        }
        result
    }

    async fn invoke_fetch(&self, req: WorkerRequest) -> Result<WorkerResponse> {
        let object = self.inner.ensure_object(&self.cell).await?;
        self.cell.shared.gate.wait_ready().await;
        let _guard = self.cell.call_lock.lock().await;
        object.fetch(req).await
    }

    /// RPC-style invocation of any method other than `fetch`.
    pub async fn call(&self, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
        let _span = self.inner.tracer.span(method, None);
        let object = self.inner.ensure_object(&self.cell).await?;
        self.cell.shared.gate.wait_ready().await;
        let _guard = self.cell.call_lock.lock().await;
        object.call(method, args).await
    }

    /// The state handle, for tests and for container wiring.
    pub fn state(&self) -> DoState {
        DoState {
            shared: Arc::clone(&self.cell.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;

    struct Counter {
        state: DoState,
        warm: AtomicI64,
    }

    #[async_trait]
    impl DurableObject for Counter {
        async fn call(&self, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value> {
            match method {
                "increment" => {
                    let storage = self.state.storage();
                    let current = storage
                        .get("count")
                        .await?
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    let next = current + args.first().and_then(|v| v.as_i64()).unwrap_or(1);
                    storage.put("count", serde_json::json!(next)).await?;
                    Ok(serde_json::json!(next))
                }
                "warm" => Ok(serde_json::json!(self.warm.load(Ordering::SeqCst))),
                _ => Err(anyhow!("no method {method}")),
            }
        }
    }

    struct CounterFactory;
    impl DurableObjectFactory for CounterFactory {
        fn construct(&self, state: DoState, _env: Env) -> Arc<dyn DurableObject> {
            let object = Arc::new(Counter {
                state: state.clone(),
                warm: AtomicI64::new(0),
            });
            // Async init gates the instance: stub calls must observe warm=1.
            let warm_ref = Arc::clone(&object);
            state.block_concurrency_while(async move {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                warm_ref.warm.store(1, Ordering::SeqCst);
                Ok(())
            });
            object
        }
    }

    async fn namespace(dir: &std::path::Path) -> DoNamespace {
        let storage = Storage::open(dir).await.unwrap();
        let ns = DoNamespace::new(
            storage.pool(),
            "Counter",
            dir.join("do-sql").join("Counter"),
            BindingTracer::disabled("durable_object"),
        );
        ns.wire(Arc::new(CounterFactory), Env::empty());
        ns
    }

    #[tokio::test]
    async fn id_from_name_is_deterministic_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let ns = namespace(dir.path()).await;
        let a = ns.id_from_name("room-1");
        let b = ns.id_from_name("room-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, ns.id_from_name("room-2"));
        assert_ne!(ns.new_unique_id(), ns.new_unique_id());
    }

    #[tokio::test]
    async fn id_from_string_validates() {
        let dir = tempfile::tempdir().unwrap();
        let ns = namespace(dir.path()).await;
        assert!(ns.id_from_string("abc123").is_ok());
        assert!(ns.id_from_string("not-hex!").is_err());
    }

    #[tokio::test]
    async fn stub_calls_wait_for_block_concurrency_while() {
        let dir = tempfile::tempdir().unwrap();
        let ns = namespace(dir.path()).await;
        let stub = ns.get_by_name("a");
        // First call constructs the instance; the constructor gates it for
        // 30 ms, so the call must observe the post-init state.
        let warm = stub.call("warm", vec![]).await.unwrap();
        assert_eq!(warm, serde_json::json!(1));
    }

    #[tokio::test]
    async fn same_identity_shares_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let ns = namespace(dir.path()).await;
        let one = ns.get_by_name("room");
        let two = ns.get_by_name("room");
        one.call("increment", vec![serde_json::json!(5)]).await.unwrap();
        let result = two.call("increment", vec![serde_json::json!(1)]).await.unwrap();
        assert_eq!(result, serde_json::json!(6));
    }

    #[tokio::test]
    async fn unwired_namespace_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let ns = DoNamespace::new(
            storage.pool(),
            "Ghost",
            dir.path().join("do-sql").join("Ghost"),
            BindingTracer::disabled("durable_object"),
        );
        let stub = ns.get_by_name("x");
        let err = stub.call("anything", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("not wired"));
    }
}
