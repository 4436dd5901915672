use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use crate::config::{AppConfig, ADAPTER_HTTP_TIMEOUT_SECS};
use crate::dataset::{DatasetSource, FsDatasetSource};
use crate::evaluation::db::EvalDb;
use crate::providers::{AdapterFactory, HttpAdapterFactory};

pub type SharedState = Arc<AppState>;

/// Handle to a live job worker. Exists only while the worker runs; the
/// database row is the durable record.
pub struct JobHandle {
    pub cancel_tx: watch::Sender<bool>,
}

pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<EvalDb>,
    pub datasets: Arc<dyn DatasetSource>,
    pub adapters: Arc<dyn AdapterFactory>,
    /// Live workers keyed by job id. The registry and the progress counters
    /// are the only state touched by concurrent workers.
    pub jobs: RwLock<HashMap<String, JobHandle>>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ADAPTER_HTTP_TIMEOUT_SECS))
            .build()?;
        let db = Arc::new(EvalDb::new(&config.db_path)?);
        let datasets = Arc::new(FsDatasetSource::new(config.data_dir.clone()));
        let adapters = Arc::new(HttpAdapterFactory::new(http_client.clone()));
        Ok(Self::with_parts(config, db, datasets, adapters, http_client))
    }

    /// Assembles state from explicit collaborators; tests swap in memory
    /// datasets and scripted adapter factories here.
    pub fn with_parts(
        config: AppConfig,
        db: Arc<EvalDb>,
        datasets: Arc<dyn DatasetSource>,
        adapters: Arc<dyn AdapterFactory>,
        http_client: reqwest::Client,
    ) -> Self {
        AppState {
            config,
            db,
            datasets,
            adapters,
            jobs: RwLock::new(HashMap::new()),
            http_client,
        }
    }

    pub async fn active_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Signals the worker for `job_id` to stop enqueuing images. Returns
    /// false when no worker is registered (job never started or already
    /// settled), which callers treat as a no-op.
    pub async fn request_cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(job_id) {
            Some(handle) => handle.cancel_tx.send(true).is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
