pub mod bindings;
pub mod config;
pub mod context;
pub mod cron;
pub mod crypto_extras;
pub mod dispatch;
pub mod error_page;
pub mod generation;
pub mod http_types;
pub mod rewriter;
pub mod server;
pub mod storage;
pub mod streams;
pub mod trace;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use generation::GenerationManager;
use storage::Storage;
use trace::TraceSink;
use worker::ModuleLoader;

/// Shared emulator state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct Emulator {
    pub storage: Arc<Storage>,
    pub generations: Arc<GenerationManager>,
    pub trace: Arc<dyn TraceSink>,
    pub started_at: std::time::Instant,
}

impl Emulator {
    /// Open the storage substrate, build the first generation, and return the
    /// shared handle. The caller starts the HTTP server and (optionally) the
    /// source watcher on top of this.
    pub async fn start(
        config_path: PathBuf,
        data_dir: PathBuf,
        loader: Arc<dyn ModuleLoader>,
        trace: Arc<dyn TraceSink>,
    ) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::open(&data_dir).await?);
        let generations = Arc::new(GenerationManager::new(
            config_path,
            Arc::clone(&storage),
            loader,
            Arc::clone(&trace),
        ));
        generations.reload().await?;
        Ok(Self {
            storage,
            generations,
            trace,
            started_at: std::time::Instant::now(),
        })
    }
}
