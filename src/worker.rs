//! The worker contract: what the dispatch core calls on user code.
//!
//! A JS worker is "a module with a default export plus named exports". The
//! Rust rendering is a `WorkerModule`: an optional default handler
//! implementing [`Worker`] and a named-export registry mapping export names
//! to class factories (Durable Object, Workflow, service entrypoint). The
//! generation manager obtains modules through a [`ModuleLoader`], which is
//! how hot reload swaps user code.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::bindings::durable::DoState;
use crate::bindings::queue::MessageBatch;
use crate::bindings::workflow::{WorkflowEvent, WorkflowStep};
use crate::bindings::Env;
use crate::config::WorkerConfig;
use crate::context::ExecutionContext;
use crate::http_types::{WorkerRequest, WorkerResponse};

// ─── Scheduled controller ─────────────────────────────────────────────────────

/// Argument to the `scheduled` entrypoint.
#[derive(Debug, Clone)]
pub struct ScheduledController {
    /// Epoch milliseconds of the tick that fired.
    pub scheduled_time: i64,
    /// The cron expression that matched.
    pub cron: String,
}

impl ScheduledController {
    pub fn event_type(&self) -> &'static str {
        "scheduled"
    }

    /// Accepted for contract compatibility; retries are not modelled locally.
    pub fn no_retry(&self) {}
}

/// Argument to a Durable Object's `alarm` handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmInfo {
    pub retry_count: u32,
    pub is_retry: bool,
}

// ─── Worker (default export) ──────────────────────────────────────────────────

/// The default export. Implement only the entrypoints the worker declares;
/// the defaults surface the platform's "handler does not export" error.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn fetch(
        &self,
        _req: WorkerRequest,
        _env: Env,
        _ctx: ExecutionContext,
    ) -> Result<WorkerResponse> {
        Err(anyhow!("worker does not export a fetch handler"))
    }

    async fn scheduled(
        &self,
        _controller: ScheduledController,
        _env: Env,
        _ctx: ExecutionContext,
    ) -> Result<()> {
        Err(anyhow!("worker does not export a scheduled handler"))
    }

    async fn queue(&self, _batch: &MessageBatch, _env: Env, _ctx: ExecutionContext) -> Result<()> {
        Err(anyhow!("worker does not export a queue handler"))
    }

    /// RPC method dispatch for service bindings targeting the default export.
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        Err(anyhow!("worker does not export a method named '{method}'"))
    }
}

// ─── Durable Object classes ───────────────────────────────────────────────────

#[async_trait]
pub trait DurableObject: Send + Sync {
    async fn fetch(&self, _req: WorkerRequest) -> Result<WorkerResponse> {
        Err(anyhow!("durable object does not implement fetch"))
    }

    async fn alarm(&self, _info: AlarmInfo) -> Result<()> {
        Ok(())
    }

    /// RPC method dispatch for stub calls other than `fetch`.
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        Err(anyhow!("durable object has no method '{method}'"))
    }

    async fn web_socket_message(
        &self,
        _ws: crate::bindings::durable::websocket::WebSocketHandle,
        _message: crate::bindings::durable::websocket::WsMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn web_socket_close(
        &self,
        _ws: crate::bindings::durable::websocket::WebSocketHandle,
        _code: u16,
        _reason: String,
        _was_clean: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn web_socket_error(
        &self,
        _ws: crate::bindings::durable::websocket::WebSocketHandle,
        _error: String,
    ) -> Result<()> {
        Ok(())
    }
}

/// Constructs instances of one exported DO class. The constructor runs on
/// first use of an id; `state.block_concurrency_while` may be used inside to
/// gate the instance until async init completes.
pub trait DurableObjectFactory: Send + Sync {
    fn construct(&self, state: DoState, env: Env) -> Arc<dyn DurableObject>;
}

// ─── Workflow classes ─────────────────────────────────────────────────────────

#[async_trait]
pub trait WorkflowEntrypoint: Send + Sync {
    async fn run(&self, event: WorkflowEvent, step: WorkflowStep) -> Result<Value>;
}

pub trait WorkflowFactory: Send + Sync {
    fn construct(&self, env: Env) -> Arc<dyn WorkflowEntrypoint>;
}

// ─── Service entrypoint classes ───────────────────────────────────────────────

#[async_trait]
pub trait ServiceEntrypoint: Send + Sync {
    async fn fetch(&self, _req: WorkerRequest) -> Result<WorkerResponse> {
        Err(anyhow!("entrypoint does not implement fetch"))
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value> {
        Err(anyhow!("entrypoint has no method '{method}'"))
    }
}

pub trait ServiceEntrypointFactory: Send + Sync {
    fn construct(&self, env: Env) -> Arc<dyn ServiceEntrypoint>;
}

// ─── Module & loader ──────────────────────────────────────────────────────────

/// A named export the binding builder can wire.
#[derive(Clone)]
pub enum Export {
    DurableObject(Arc<dyn DurableObjectFactory>),
    Workflow(Arc<dyn WorkflowFactory>),
    Entrypoint(Arc<dyn ServiceEntrypointFactory>),
}

/// Which entrypoints the default export implements. Drives 404s on the
/// manual dispatch endpoints and consumer startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerSet {
    pub fetch: bool,
    pub scheduled: bool,
    pub queue: bool,
}

/// A loaded worker module: default handler plus the named-export registry.
#[derive(Clone, Default)]
pub struct WorkerModule {
    pub default: Option<Arc<dyn Worker>>,
    pub handlers: HandlerSet,
    exports: HashMap<String, Export>,
}

impl WorkerModule {
    pub fn new(default: Arc<dyn Worker>, handlers: HandlerSet) -> Self {
        Self {
            default: Some(default),
            handlers,
            exports: HashMap::new(),
        }
    }

    /// Register a named export. Later registrations replace earlier ones,
    /// like module re-evaluation would.
    pub fn export(mut self, name: impl Into<String>, export: Export) -> Self {
        self.exports.insert(name.into(), export);
        self
    }

    /// Resolve a named export; the binding builder looks each required name
    /// up exactly once at wiring time.
    pub fn resolve(&self, name: &str) -> Result<&Export> {
        self.exports
            .get(name)
            .ok_or_else(|| anyhow!("worker module does not export '{name}'"))
    }
}

/// Produces a `WorkerModule` for a configuration. Reload calls this again;
/// a failed load keeps the previous generation active.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, config: &WorkerConfig) -> Result<WorkerModule>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWorker;
    impl Worker for NoopWorker {}

    #[tokio::test]
    async fn default_handlers_surface_missing_export_errors() {
        let worker = NoopWorker;
        let err = worker
            .scheduled(
                ScheduledController {
                    scheduled_time: 0,
                    cron: "* * * * *".into(),
                },
                Env::empty(),
                ExecutionContext::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scheduled"));
    }

    #[test]
    fn resolve_unknown_export_is_an_error() {
        let module = WorkerModule::default();
        assert!(module.resolve("Counter").is_err());
    }
}
