#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use visionbench::config::{AppConfig, DEFAULT_PORT};
use visionbench::dataset::{DatasetItem, DatasetSnapshot, MemoryDatasetSource};
use visionbench::evaluation::db::EvalDb;
use visionbench::evaluation::{PromptStep, QuestionKind, QuestionSpec};
use visionbench::providers::{
    AdapterError, AdapterFactory, AdapterResponse, ModelAdapter, ModelConfig, ProviderKind,
};
use visionbench::state::{AppState, SharedState};

/// Image payload that makes the echo adapter fail with a transient error.
pub const FAIL_PAYLOAD: &str = "ERR";

/// Answers every call with the image payload interpreted as UTF-8, so each
/// image's outcome is fixed regardless of how dispatch interleaves. Tracks
/// concurrent in-flight calls for the concurrency-bound assertions.
pub struct EchoAdapter {
    pub calls: AtomicU32,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub call_delay: Duration,
    pub cancel_on_call: Option<watch::Sender<bool>>,
}

impl EchoAdapter {
    pub fn new() -> Self {
        EchoAdapter {
            calls: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            call_delay: Duration::ZERO,
            cancel_on_call: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        EchoAdapter {
            call_delay: delay,
            ..Self::new()
        }
    }

    pub fn cancelling(cancel_tx: watch::Sender<bool>) -> Self {
        EchoAdapter {
            cancel_on_call: Some(cancel_tx),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelAdapter for EchoAdapter {
    async fn invoke(
        &self,
        _system_message: Option<&str>,
        _prompt: &str,
        image: &Bytes,
    ) -> Result<AdapterResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if let Some(tx) = &self.cancel_on_call {
            let _ = tx.send(true);
        }
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let text = String::from_utf8_lossy(image).to_string();
        if text == FAIL_PAYLOAD {
            return Err(AdapterError::Transient("scripted provider outage".into()));
        }
        Ok(AdapterResponse {
            text,
            latency_ms: 3,
            input_tokens: Some(1_000),
            output_tokens: Some(20),
            cost: Some(0.0005),
        })
    }
}

/// Hands out the same adapter for every model config.
pub struct FixedFactory {
    pub adapter: Arc<dyn ModelAdapter>,
}

impl AdapterFactory for FixedFactory {
    fn build(&self, _config: &ModelConfig) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        Ok(self.adapter.clone())
    }
}

/// (image_id, ground_truth, payload) triples to a snapshot; the payload is
/// what the echo adapter will answer for that image.
pub fn snapshot(
    dataset_id: &str,
    kind: QuestionKind,
    items: &[(&str, Option<&str>, &str)],
) -> DatasetSnapshot {
    DatasetSnapshot {
        dataset_id: dataset_id.to_string(),
        question: QuestionSpec {
            kind,
            options: vec![],
        },
        items: items
            .iter()
            .map(|(id, gt, payload)| DatasetItem {
                image_id: id.to_string(),
                image: Bytes::from(payload.as_bytes().to_vec()),
                ground_truth: gt.map(|s| s.to_string()),
            })
            .collect(),
    }
}

pub fn model_config(concurrency: usize) -> ModelConfig {
    ModelConfig {
        provider: ProviderKind::Gemini,
        model_name: "gemini-2.0-flash".to_string(),
        temperature: 0.0,
        max_tokens: 64,
        concurrency,
        api_key: Some("test-key".to_string()),
    }
}

pub fn step(n: u32, prompt: &str) -> PromptStep {
    PromptStep {
        step_number: n,
        system_message: None,
        prompt: prompt.to_string(),
    }
}

pub fn test_state(
    dir: &Path,
    snapshots: Vec<DatasetSnapshot>,
    adapter: Arc<dyn ModelAdapter>,
) -> SharedState {
    let config = AppConfig {
        data_dir: dir.to_path_buf(),
        db_path: dir.join("visionbench-test.db"),
        port: DEFAULT_PORT,
    };
    let db = Arc::new(EvalDb::new(&config.db_path).unwrap());
    let mut datasets = MemoryDatasetSource::new();
    for snap in snapshots {
        datasets.insert(snap);
    }
    Arc::new(AppState::with_parts(
        config,
        db,
        Arc::new(datasets),
        Arc::new(FixedFactory { adapter }),
        reqwest::Client::new(),
    ))
}
