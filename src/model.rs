//! Records stored in the four collections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reference count for one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub count: u32,
}

impl FileMeta {
    /// Metadata for a file referenced for the first time
    pub fn first(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            count: 1,
        }
    }
}

/// A single file referenced by an analysis.
///
/// Only `id` is interpreted; any other descriptor fields are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

/// Files belonging to one named dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetFiles {
    #[serde(default)]
    pub files: Vec<FileReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Dataset name -> referenced files, as persisted in `analysis_meta.files`.
///
/// Serialized as `{"datasets": {"<name>": {"files": [{"id": ...}]}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileReferenceGraph {
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetFiles>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file reference under `dataset`, creating the dataset if needed
    pub fn with_file(mut self, dataset: &str, file_id: &str) -> Self {
        self.add_file(dataset, file_id);
        self
    }

    pub fn add_file(&mut self, dataset: &str, file_id: &str) {
        self.datasets
            .entry(dataset.to_string())
            .or_default()
            .files
            .push(FileReference::new(file_id));
    }

    /// Every referenced file id, dataset by dataset. Duplicates are kept.
    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.datasets
            .values()
            .flat_map(|dataset| dataset.files.iter().map(|f| f.id.as_str()))
    }

    pub fn reference_count(&self) -> usize {
        self.datasets.values().map(|d| d.files.len()).sum()
    }
}

/// Full analysis metadata including its file references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMeta {
    pub id: String,
    pub files: FileReferenceGraph,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    pub title: String,
}

impl AnalysisMeta {
    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            id: self.id.clone(),
            time: self.time,
            title: self.title.clone(),
        }
    }
}

/// Analysis metadata without the file reference graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub id: String,
    pub time: i64,
    pub title: String,
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
