//! Generation manager: hot reload with atomic swap-in of a new binding
//! graph.
//!
//! Generations get monotone ids; at most one is active. `reload` builds the
//! replacement off-path and swaps the pointer only on success, so a broken
//! config or module load keeps the current generation serving. The source
//! watcher debounces changes and triggers reloads on the runtime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecursiveMode, Watcher as _},
    DebounceEventResult,
};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::dispatch::{build_generation, Generation};
use crate::storage::Storage;
use crate::trace::TraceSink;
use crate::worker::ModuleLoader;

/// Debounce window for source changes.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(150);

/// Extensions that trigger a reload.
const WATCHED_EXTENSIONS: [&str; 5] = ["ts", "js", "tsx", "jsx", "json"];

/// Directory names the watcher ignores.
const IGNORED_DIRS: [&str; 5] = [".git", "node_modules", "target", ".bunflare", "dist"];

pub struct GenerationManager {
    config_path: PathBuf,
    storage: Arc<Storage>,
    loader: Arc<dyn ModuleLoader>,
    trace: Arc<dyn TraceSink>,
    counter: AtomicU64,
    active: StdRwLock<Option<Arc<Generation>>>,
}

impl GenerationManager {
    pub fn new(
        config_path: PathBuf,
        storage: Arc<Storage>,
        loader: Arc<dyn ModuleLoader>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            config_path,
            storage,
            loader,
            trace,
            counter: AtomicU64::new(0),
            active: StdRwLock::new(None),
        }
    }

    /// The active generation. Read on every request; never blocks on a
    /// reload in progress.
    pub fn active(&self) -> Result<Arc<Generation>> {
        self.active
            .read()
            .expect("active lock")
            .clone()
            .ok_or_else(|| anyhow!("no active generation"))
    }

    /// Re-read the config file and swap in a new generation.
    pub async fn reload(&self) -> Result<u64> {
        let config = WorkerConfig::load(&self.config_path, None)
            .map_err(|e| anyhow!("config load failed: {e}"))?;
        self.reload_with(config).await
    }

    /// Build a generation from `config` off-path, then atomically swap it
    /// in. The previous generation's background workers are cancelled;
    /// in-flight requests drain against its orphaned env.
    pub async fn reload_with(&self, config: WorkerConfig) -> Result<u64> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = build_generation(
            id,
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.loader),
            Arc::clone(&self.trace),
        )
        .await?;

        let previous = {
            let mut active = self.active.write().expect("active lock");
            active.replace(generation)
        };
        if let Some(previous) = previous {
            previous.retire();
        }
        info!(generation = id, "generation active");
        Ok(id)
    }

    /// Retire the active generation (shutdown).
    pub fn shutdown(&self) {
        if let Some(generation) = self.active.write().expect("active lock").take() {
            generation.retire();
        }
    }

    /// Start the debounced source watcher over `watch_root`. A change to a
    /// watched extension triggers `reload`; a failed reload keeps the
    /// current generation active and logs the error. The returned debouncer
    /// must be kept alive.
    pub fn watch(
        self: &Arc<Self>,
        watch_root: &Path,
    ) -> Result<
        notify_debouncer_full::Debouncer<
            notify_debouncer_full::notify::RecommendedWatcher,
            notify_debouncer_full::FileIdMap,
        >,
    > {
        let manager = Arc::clone(self);
        let data_root = self.storage.root().to_path_buf();
        let rt = tokio::runtime::Handle::current();
        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            None,
            move |result: DebounceEventResult| {
                let events = match result {
                    Ok(events) => events,
                    Err(errors) => {
                        for e in errors {
                            warn!(err = %e, "source watcher error");
                        }
                        return;
                    }
                };
                let relevant = events
                    .iter()
                    .flat_map(|event| event.paths.iter())
                    .any(|path| watch_relevant(path, &data_root));
                if !relevant {
                    return;
                }
                let manager = Arc::clone(&manager);
                rt.spawn(async move {
                    info!("source change detected; reloading");
                    if let Err(e) = manager.reload().await {
                        error!(err = %e, "reload failed; keeping current generation");
                    }
                });
            },
        )?;
        debouncer
            .watcher()
            .watch(watch_root, RecursiveMode::Recursive)?;
        info!(path = %watch_root.display(), "source watcher started");
        Ok(debouncer)
    }
}

/// Should a change to `path` trigger a reload?
fn watch_relevant(path: &Path, data_root: &Path) -> bool {
    if path.starts_with(data_root) {
        return false;
    }
    if path
        .components()
        .any(|c| IGNORED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
    {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| WATCHED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}
