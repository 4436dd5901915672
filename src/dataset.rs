//! Dataset access behind the `DatasetSource` capability.
//!
//! The engine never walks directories itself: it asks a source to describe
//! a dataset at job creation (question + image count, no image bytes) and
//! to load the full snapshot once the job starts running. The filesystem
//! source reads a `dataset.json` manifest; the in-memory source backs tests
//! and embedded use.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::evaluation::QuestionSpec;

const MANIFEST_FILE: &str = "dataset.json";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset {0} not found")]
    NotFound(String),

    #[error("invalid manifest for {dataset_id}: {reason}")]
    InvalidManifest { dataset_id: String, reason: String },

    #[error("failed to read image {image_id}: {source}")]
    ImageRead {
        image_id: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DatasetItem {
    pub image_id: String,
    pub image: Bytes,
    pub ground_truth: Option<String>,
}

/// Full dataset read, taken once per job run. Item order follows the
/// manifest so dispatch order is stable.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub dataset_id: String,
    pub question: QuestionSpec,
    pub items: Vec<DatasetItem>,
}

#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub dataset_id: String,
    pub question: QuestionSpec,
    pub image_count: usize,
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Manifest-only read used at job creation and cost estimation.
    async fn describe(&self, dataset_id: &str) -> Result<DatasetSummary, DatasetError>;

    /// Full read including image bytes.
    async fn load(&self, dataset_id: &str) -> Result<DatasetSnapshot, DatasetError>;
}

// ============================================================================
// Filesystem source
// ============================================================================

#[derive(Debug, Deserialize)]
struct Manifest {
    question: QuestionSpec,
    #[serde(default)]
    images: Vec<ManifestImage>,
}

#[derive(Debug, Deserialize)]
struct ManifestImage {
    id: String,
    file: String,
    #[serde(default)]
    ground_truth: Option<String>,
}

/// Reads datasets laid out as `<root>/<dataset_id>/dataset.json` plus the
/// image files the manifest references (relative to the dataset directory).
pub struct FsDatasetSource {
    root: PathBuf,
}

impl FsDatasetSource {
    pub fn new(root: PathBuf) -> Self {
        FsDatasetSource { root }
    }

    async fn read_manifest(&self, dataset_id: &str) -> Result<Manifest, DatasetError> {
        // Dataset ids come straight from API requests; anything that could
        // escape the root directory is treated as nonexistent.
        if dataset_id.is_empty()
            || dataset_id == "."
            || dataset_id == ".."
            || dataset_id.contains(['/', '\\'])
        {
            return Err(DatasetError::NotFound(dataset_id.to_string()));
        }

        let path = self.root.join(dataset_id).join(MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::NotFound(dataset_id.to_string()));
            }
            Err(e) => return Err(DatasetError::Io(e)),
        };

        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| DatasetError::InvalidManifest {
                dataset_id: dataset_id.to_string(),
                reason: e.to_string(),
            })?;
        validate_manifest(dataset_id, &manifest)?;
        Ok(manifest)
    }
}

fn validate_manifest(dataset_id: &str, manifest: &Manifest) -> Result<(), DatasetError> {
    let invalid = |reason: String| DatasetError::InvalidManifest {
        dataset_id: dataset_id.to_string(),
        reason,
    };

    let mut seen = HashSet::new();
    for image in &manifest.images {
        if image.id.is_empty() {
            return Err(invalid("image with empty id".to_string()));
        }
        if !seen.insert(image.id.as_str()) {
            return Err(invalid(format!("duplicate image id {:?}", image.id)));
        }
        let path = Path::new(&image.file);
        if path.as_os_str().is_empty() {
            return Err(invalid(format!("image {:?} has an empty file path", image.id)));
        }
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(invalid(format!(
                "image {:?} file path escapes the dataset directory",
                image.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl DatasetSource for FsDatasetSource {
    async fn describe(&self, dataset_id: &str) -> Result<DatasetSummary, DatasetError> {
        let manifest = self.read_manifest(dataset_id).await?;
        Ok(DatasetSummary {
            dataset_id: dataset_id.to_string(),
            question: manifest.question,
            image_count: manifest.images.len(),
        })
    }

    async fn load(&self, dataset_id: &str) -> Result<DatasetSnapshot, DatasetError> {
        let manifest = self.read_manifest(dataset_id).await?;
        let dir = self.root.join(dataset_id);

        let mut items = Vec::with_capacity(manifest.images.len());
        for image in manifest.images {
            let bytes = tokio::fs::read(dir.join(&image.file))
                .await
                .map_err(|e| DatasetError::ImageRead {
                    image_id: image.id.clone(),
                    source: e,
                })?;
            items.push(DatasetItem {
                image_id: image.id,
                image: Bytes::from(bytes),
                ground_truth: image.ground_truth,
            });
        }

        Ok(DatasetSnapshot {
            dataset_id: dataset_id.to_string(),
            question: manifest.question,
            items,
        })
    }
}

// ============================================================================
// In-memory source
// ============================================================================

#[derive(Default)]
pub struct MemoryDatasetSource {
    datasets: HashMap<String, DatasetSnapshot>,
}

impl MemoryDatasetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, snapshot: DatasetSnapshot) {
        self.datasets.insert(snapshot.dataset_id.clone(), snapshot);
    }
}

#[async_trait]
impl DatasetSource for MemoryDatasetSource {
    async fn describe(&self, dataset_id: &str) -> Result<DatasetSummary, DatasetError> {
        let snapshot = self
            .datasets
            .get(dataset_id)
            .ok_or_else(|| DatasetError::NotFound(dataset_id.to_string()))?;
        Ok(DatasetSummary {
            dataset_id: snapshot.dataset_id.clone(),
            question: snapshot.question.clone(),
            image_count: snapshot.items.len(),
        })
    }

    async fn load(&self, dataset_id: &str) -> Result<DatasetSnapshot, DatasetError> {
        self.datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(dataset_id.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
