//! Service bindings: in-process proxies invoking another worker's default
//! export or a named entrypoint class.
//!
//! The proxy is created unwired at env-build time and bound to the target
//! module + env during generation wiring, after every module has loaded.

use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::bindings::Env;
use crate::context::ExecutionContext;
use crate::http_types::{WorkerRequest, WorkerResponse};
use crate::trace::BindingTracer;
use crate::worker::{ServiceEntrypoint, WorkerModule};

enum Target {
    /// The target module's default export.
    Default(WorkerModule, Env),
    /// An instance of the named entrypoint class, constructed with the
    /// target's env at wiring time.
    Entrypoint(Arc<dyn ServiceEntrypoint>),
}

/// A resolved call target, detached from the wiring lock.
enum Dispatch {
    Worker(Arc<dyn crate::worker::Worker>, Env),
    Entry(Arc<dyn ServiceEntrypoint>),
}

struct ServiceInner {
    service: String,
    entrypoint: Option<String>,
    tracer: BindingTracer,
    target: StdRwLock<Option<Target>>,
}

#[derive(Clone)]
pub struct ServiceBinding {
    inner: Arc<ServiceInner>,
}

impl ServiceBinding {
    pub fn new(
        service: impl Into<String>,
        entrypoint: Option<String>,
        tracer: BindingTracer,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                service: service.into(),
                entrypoint,
                tracer,
                target: StdRwLock::new(None),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service
    }

    pub fn entrypoint_name(&self) -> Option<&str> {
        self.inner.entrypoint.as_deref()
    }

    /// Bind the proxy to its target module + env. With an entrypoint name,
    /// the exported class is constructed here, once.
    pub fn wire(&self, module: WorkerModule, env: Env) -> Result<()> {
        let target = match &self.inner.entrypoint {
            None => Target::Default(module, env),
            Some(name) => {
                let export = module.resolve(name)?;
                match export {
                    crate::worker::Export::Entrypoint(factory) => {
                        Target::Entrypoint(factory.construct(env))
                    }
                    _ => {
                        return Err(anyhow!(
                            "export '{name}' of service '{}' is not an entrypoint class",
                            self.inner.service
                        ))
                    }
                }
            }
        };
        *self.inner.target.write().expect("target lock") = Some(target);
        Ok(())
    }

    pub fn is_wired(&self) -> bool {
        self.inner.target.read().expect("target lock").is_some()
    }

    /// Drop the wired target (generation retirement).
    pub fn retire(&self) {
        *self.inner.target.write().expect("target lock") = None;
    }

    fn unwired(&self) -> anyhow::Error {
        anyhow!(
            "service binding '{}' is not wired to a worker",
            self.inner.service
        )
    }

    /// HTTP mode: invoke the target's `fetch`.
    pub async fn fetch(&self, req: WorkerRequest) -> Result<WorkerResponse> {
        let mut span = self.inner.tracer.span("fetch", Some(req.path()));
        let result = self.fetch_inner(req).await;
        if let Err(ref e) = result {
            span.fail(e);
        }
        result
    }

    /// Clone the dispatch target out so no lock is held across an await.
    fn dispatch_target(&self) -> Result<Dispatch> {
        let guard = self.inner.target.read().expect("target lock");
        match guard.as_ref() {
            None => Err(self.unwired()),
            Some(Target::Default(module, env)) => {
                let worker = module.default.clone().ok_or_else(|| {
                    anyhow!("service '{}' has no default export", self.inner.service)
                })?;
                Ok(Dispatch::Worker(worker, env.clone()))
            }
            Some(Target::Entrypoint(instance)) => Ok(Dispatch::Entry(Arc::clone(instance))),
        }
    }

    async fn fetch_inner(&self, req: WorkerRequest) -> Result<WorkerResponse> {
        match self.dispatch_target()? {
            Dispatch::Worker(worker, env) => worker.fetch(req, env, ExecutionContext::new()).await,
            Dispatch::Entry(instance) => instance.fetch(req).await,
        }
    }

    /// RPC mode: any method name other than `fetch`.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let _span = self.inner.tracer.span(method, None);
        match self.dispatch_target()? {
            Dispatch::Worker(worker, _) => worker.call(method, args).await,
            Dispatch::Entry(instance) => instance.call(method, args).await,
        }
    }
}
