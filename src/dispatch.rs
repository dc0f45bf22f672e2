//! Dispatch core: build the binding graph from a configuration, wire the
//! worker module's exported classes into it, start background consumers,
//! and invoke the worker's entrypoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context as _, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bindings::assets::{AssetsBinding, HtmlHandling, NotFoundHandling};
use crate::bindings::cache::CacheBinding;
use crate::bindings::container::{ContainerRuntime, ContainerSpec};
use crate::bindings::d1::D1Database;
use crate::bindings::durable::DoNamespace;
use crate::bindings::images::ImagesBinding;
use crate::bindings::kv::KvNamespace;
use crate::bindings::queue::{
    MessageBatch, QueueConsumer, QueueConsumerConfig, QueueHandler, QueueProducer,
};
use crate::bindings::r2::{R2Bucket, R2Limits};
use crate::bindings::service::ServiceBinding;
use crate::bindings::workflow::WorkflowBinding;
use crate::bindings::{Binding, Env};
use crate::config::WorkerConfig;
use crate::context::ExecutionContext;
use crate::error_page::render_error;
use crate::http_types::{WorkerRequest, WorkerResponse};
use crate::storage::{now_ms, Storage};
use crate::trace::{BindingTracer, ErrorRecord, TraceSink};
use crate::worker::{Export, ModuleLoader, ScheduledController, WorkerModule};

/// One built generation: configuration + loaded module + binding graph +
/// the background tasks it owns.
pub struct Generation {
    pub id: u64,
    pub config: WorkerConfig,
    pub module: WorkerModule,
    pub env: Env,
    trace: Arc<dyn TraceSink>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    do_namespaces: Vec<DoNamespace>,
    workflow_bindings: Vec<WorkflowBinding>,
    service_bindings: Vec<ServiceBinding>,
    /// The default cache, exposed alongside the env like the global
    /// `caches` object.
    pub cache: CacheBinding,
}

impl Generation {
    /// Invoke the worker's `fetch`. Errors are translated into the error
    /// page and persisted through the trace sink; the dispatcher itself
    /// never fails.
    pub async fn fetch(&self, req: WorkerRequest) -> WorkerResponse {
        let ctx = ExecutionContext::new();
        let result = match self.module.default.as_ref() {
            Some(worker) if self.module.handlers.fetch => {
                worker.fetch(req.clone(), self.env.clone(), ctx.clone()).await
            }
            _ => match &self.config.assets {
                // Asset-only workers serve straight from the resolver.
                Some(_) => self.serve_assets(&req).await,
                None => Err(anyhow!("worker does not export a fetch handler")),
            },
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.trace.persist_error(&ErrorRecord {
                    name: "FetchError".to_string(),
                    message: e.to_string(),
                    method: req.method.to_string(),
                    url: req.url(),
                });
                render_error(&req, &self.env, &e)
            }
        };
        // Background promises settle after the response; never propagate.
        ctx.await_all().await;
        response
    }

    async fn serve_assets(&self, req: &WorkerRequest) -> Result<WorkerResponse> {
        let assets_config = self
            .config
            .assets
            .as_ref()
            .ok_or_else(|| anyhow!("no assets configured"))?;
        let binding = AssetsBinding::new(
            assets_config.directory.clone().into(),
            HtmlHandling::parse(assets_config.html_handling.as_deref().unwrap_or_default()),
            NotFoundHandling::parse(assets_config.not_found_handling.as_deref().unwrap_or_default()),
            BindingTracer::new(Arc::clone(&self.trace), "assets", "__assets"),
        );
        binding.fetch(req).await
    }

    /// Invoke the worker's `scheduled` entrypoint for one cron expression.
    pub async fn scheduled(&self, cron: &str, scheduled_time: i64) -> Result<()> {
        let worker = self
            .module
            .default
            .clone()
            .filter(|_| self.module.handlers.scheduled)
            .ok_or_else(|| anyhow!("worker does not export a scheduled handler"))?;
        let ctx = ExecutionContext::new();
        let controller = ScheduledController {
            scheduled_time,
            cron: cron.to_string(),
        };
        let result = worker.scheduled(controller, self.env.clone(), ctx.clone()).await;
        ctx.await_all().await;
        result
    }

    pub fn has_scheduled_handler(&self) -> bool {
        self.module.handlers.scheduled && self.module.default.is_some()
    }

    /// Cancel this generation's background work and drop its wiring.
    /// In-flight requests keep their handles and drain against the orphaned
    /// env.
    pub fn retire(&self) {
        let mut tasks = self.tasks.lock().expect("tasks lock");
        for task in tasks.drain(..) {
            task.abort();
        }
        for namespace in &self.do_namespaces {
            namespace.retire();
        }
        for workflow in &self.workflow_bindings {
            workflow.retire();
        }
        for service in &self.service_bindings {
            service.retire();
        }
        info!(generation = self.id, "generation retired");
    }

    fn keep_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("tasks lock").push(task);
    }
}

/// Adapter from the queue consumer to the worker's `queue` entrypoint.
/// `waitUntil` promises are awaited before decisions are finalized.
struct WorkerQueueHandler {
    module: WorkerModule,
    env: Env,
}

#[async_trait::async_trait]
impl QueueHandler for WorkerQueueHandler {
    async fn handle(&self, batch: &MessageBatch) -> Result<()> {
        let worker = self
            .module
            .default
            .clone()
            .filter(|_| self.module.handlers.queue)
            .ok_or_else(|| anyhow!("worker does not export a queue handler"))?;
        let ctx = ExecutionContext::new();
        let result = worker.queue(batch, self.env.clone(), ctx.clone()).await;
        ctx.await_all().await;
        result
    }
}

/// Build a complete generation: env, class wiring, consumers, cron.
pub async fn build_generation(
    id: u64,
    config: WorkerConfig,
    storage: Arc<Storage>,
    loader: Arc<dyn ModuleLoader>,
    trace: Arc<dyn TraceSink>,
) -> Result<Arc<Generation>> {
    let pool = storage.pool();
    let tracer = |binding: &'static str, slot: &str| {
        BindingTracer::new(Arc::clone(&trace), binding, slot)
    };

    let mut slots: HashMap<String, Binding> = HashMap::new();
    for (name, value) in &config.vars {
        let binding = match value {
            serde_json::Value::String(s) => Binding::Var(s.clone()),
            other => Binding::Json(other.clone()),
        };
        slots.insert(name.clone(), binding);
    }

    for kv in &config.kv_namespaces {
        slots.insert(
            kv.binding.clone(),
            Binding::Kv(KvNamespace::new(pool.clone(), &kv.id, tracer("kv", &kv.binding))),
        );
    }
    for r2 in &config.r2_buckets {
        slots.insert(
            r2.binding.clone(),
            Binding::R2(R2Bucket::new(
                pool.clone(),
                &r2.bucket_name,
                storage.r2_dir(&r2.bucket_name),
                R2Limits::default(),
                tracer("r2", &r2.binding),
            )),
        );
    }
    for d1 in &config.d1_databases {
        let database = D1Database::open(
            storage.d1_path(&d1.database_name),
            tracer("d1", &d1.binding),
        )
        .await
        .with_context(|| format!("opening D1 database '{}'", d1.database_name))?;
        slots.insert(d1.binding.clone(), Binding::D1(database));
    }
    for producer in &config.queue_producers {
        slots.insert(
            producer.binding.clone(),
            Binding::Queue(QueueProducer::new(
                pool.clone(),
                &producer.queue,
                tracer("queue", &producer.binding),
            )),
        );
    }

    // Class-registry entries: slots that must be late-bound to worker
    // exports after the module loads.
    let mut do_namespaces = Vec::new();
    for durable in &config.durable_objects {
        let namespace = DoNamespace::new(
            pool.clone(),
            &durable.class_name,
            storage.root().join("do-sql").join(&durable.class_name),
            tracer("durable_object", &durable.name),
        );
        slots.insert(
            durable.name.clone(),
            Binding::DurableObject(namespace.clone()),
        );
        do_namespaces.push((namespace, durable.class_name.clone()));
    }

    let mut workflow_bindings = Vec::new();
    for workflow in &config.workflows {
        let binding = WorkflowBinding::new(
            pool.clone(),
            &workflow.name,
            &workflow.class_name,
            tracer("workflow", &workflow.binding),
        );
        slots.insert(workflow.binding.clone(), Binding::Workflow(binding.clone()));
        workflow_bindings.push((binding, workflow.class_name.clone()));
    }

    let mut service_bindings = Vec::new();
    for service in &config.services {
        let binding = ServiceBinding::new(
            &service.service,
            service.entrypoint.clone(),
            tracer("service", &service.binding),
        );
        slots.insert(service.binding.clone(), Binding::Service(binding.clone()));
        service_bindings.push(binding);
    }

    if let Some(assets) = &config.assets {
        if let Some(slot) = &assets.binding {
            slots.insert(
                slot.clone(),
                Binding::Assets(AssetsBinding::new(
                    assets.directory.clone().into(),
                    HtmlHandling::parse(assets.html_handling.as_deref().unwrap_or_default()),
                    NotFoundHandling::parse(
                        assets.not_found_handling.as_deref().unwrap_or_default(),
                    ),
                    tracer("assets", slot),
                )),
            );
        }
    }
    if let Some(images) = &config.images {
        slots.insert(
            images.binding.clone(),
            Binding::Images(ImagesBinding::new(tracer("images", &images.binding))),
        );
    }

    let cache = CacheBinding::default_cache(pool.clone(), tracer("cache", "default"));
    let env = Env::new(slots).with_cache(cache.clone());

    // Load the module, then resolve each registry entry exactly once.
    let module = loader.load(&config).await.context("loading worker module")?;

    for (namespace, class_name) in &do_namespaces {
        match module.resolve(class_name)? {
            Export::DurableObject(factory) => {
                namespace.wire(Arc::clone(factory), env.clone());
            }
            _ => return Err(anyhow!("export '{class_name}' is not a Durable Object class")),
        }
        if let Some(container) = config.container_for_class(class_name) {
            let spec = ContainerSpec {
                image: container.image.clone(),
                ..Default::default()
            };
            namespace.wire_containers(Arc::new(move |id| {
                Arc::new(ContainerRuntime::new(spec.clone(), id.as_str()))
            }));
        }
        namespace.restore_alarms().await?;
    }

    for (binding, class_name) in &workflow_bindings {
        match module.resolve(class_name)? {
            Export::Workflow(factory) => binding.wire(Arc::clone(factory), env.clone()),
            _ => return Err(anyhow!("export '{class_name}' is not a Workflow class")),
        }
        let recovered = binding.recover_interrupted().await?;
        if recovered > 0 {
            warn!(workflow = binding.workflow_name(), recovered, "marked interrupted workflow runs as errored");
        }
    }

    for binding in &service_bindings {
        binding.wire(module.clone(), env.clone())?;
    }

    // DO migration tags are recorded once; re-applying is a no-op.
    for migration in &config.migrations {
        sqlx::query("INSERT OR IGNORE INTO do_migrations (tag, applied_at) VALUES (?, ?)")
            .bind(&migration.tag)
            .bind(now_ms())
            .execute(&pool)
            .await?;
    }

    let generation = Arc::new(Generation {
        id,
        cache,
        config,
        module,
        env,
        trace,
        tasks: StdMutex::new(Vec::new()),
        do_namespaces: do_namespaces.into_iter().map(|(ns, _)| ns).collect(),
        workflow_bindings: workflow_bindings.into_iter().map(|(b, _)| b).collect(),
        service_bindings,
    });

    start_queue_consumers(&generation, &pool);
    start_cron_scheduler(&generation);

    Ok(generation)
}

fn start_queue_consumers(generation: &Arc<Generation>, pool: &sqlx::SqlitePool) {
    for consumer in &generation.config.queue_consumers {
        let mut config = QueueConsumerConfig::new(&consumer.queue);
        if let Some(size) = consumer.max_batch_size {
            config.max_batch_size = size;
        }
        if let Some(retries) = consumer.max_retries {
            config.max_retries = retries;
        }
        config.dead_letter_queue = consumer.dead_letter_queue.clone();

        let handler = Arc::new(WorkerQueueHandler {
            module: generation.module.clone(),
            env: generation.env.clone(),
        });
        let queue_consumer = QueueConsumer::new(pool.clone(), config, handler);
        generation.keep_task(tokio::spawn(queue_consumer.run()));
    }
}

/// Minute-aligned cron driver. Each tick tests every configured expression;
/// matches dispatch fire-and-forget so a slow handler cannot block the next
/// tick.
fn start_cron_scheduler(generation: &Arc<Generation>) {
    let parsed: Vec<crate::cron::CronExpr> = generation
        .config
        .crons
        .iter()
        .filter_map(|expr| match crate::cron::parse_cron(expr) {
            Ok(cron) => Some(cron),
            Err(e) => {
                // Validation already rejected these; belt and braces.
                error!(expr = %expr, err = %e, "skipping unparseable cron");
                None
            }
        })
        .collect();
    if parsed.is_empty() {
        return;
    }
    let weak = Arc::downgrade(generation);
    let task = tokio::spawn(async move {
        loop {
            let wait = crate::cron::ms_until_next_minute(chrono::Utc::now());
            tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
            let Some(generation) = weak.upgrade() else {
                return;
            };
            let now = chrono::Utc::now();
            for cron in &parsed {
                if cron.matches(now) {
                    let generation = Arc::clone(&generation);
                    let source = cron.source.clone();
                    tokio::spawn(async move {
                        if let Err(e) = generation.scheduled(&source, now_ms()).await {
                            error!(cron = %source, err = %e, "scheduled handler failed");
                        }
                    });
                }
            }
        }
    });
    generation.keep_task(task);
}
