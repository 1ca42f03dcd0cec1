//! Async entry point: one lazily opened store shared by every caller.

use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::StoreConfig;
use crate::model::{AnalysisMeta, AnalysisSummary, FileReferenceGraph};
use crate::storage::{blob, cascade, records, Collection, Mode, StorageHandle, StoreStats, Transaction};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Source {
    File(StoreConfig),
    Memory,
}

impl Source {
    fn open(&self) -> Result<StorageHandle> {
        match self {
            Source::File(config) => StorageHandle::open(config),
            Source::Memory => StorageHandle::open_in_memory(),
        }
    }
}

enum Readiness {
    Open {
        handle: StorageHandle,
        initial: Vec<AnalysisSummary>,
    },
    Failed(String),
}

struct Inner {
    source: Source,
    ready: OnceCell<Readiness>,
}

/// Handle to a KanaDB store.
///
/// The database is opened on first use and exactly once; clones share it.
/// Every operation runs as one transaction on tokio's blocking pool.
#[derive(Clone)]
pub struct KanaDb {
    inner: Arc<Inner>,
}

impl KanaDb {
    pub fn new(config: StoreConfig) -> Self {
        Self::from_source(Source::File(config))
    }

    /// A store that lives only as long as this handle (for testing)
    pub fn in_memory() -> Self {
        Self::from_source(Source::Memory)
    }

    fn from_source(source: Source) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                ready: OnceCell::new(),
            }),
        }
    }

    /// Open the store if needed and return the analyses present at open time.
    ///
    /// Returns `None` when the store could not be opened. Repeated calls
    /// return the same list without reopening.
    pub async fn initialize(&self) -> Option<Vec<AnalysisSummary>> {
        match self.ready().await {
            Readiness::Open { initial, .. } => Some(initial.clone()),
            Readiness::Failed(_) => None,
        }
    }

    async fn ready(&self) -> &Readiness {
        self.inner.ready.get_or_init(|| self.open()).await
    }

    async fn open(&self) -> Readiness {
        let source = self.inner.source.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let handle = source.open()?;
            let initial = handle.transaction(records::META_SCOPE, Mode::ReadOnly, "listing analyses", |tx| {
                records::list_analyses(tx)
            })?;
            Ok::<_, Error>((handle, initial))
        })
        .await;

        match opened {
            Ok(Ok((handle, initial))) => {
                tracing::info!(analyses = initial.len(), "store ready");
                Readiness::Open { handle, initial }
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to open store");
                Readiness::Failed(err.to_string())
            }
            Err(err) => {
                tracing::error!(error = %err, "store open task failed");
                Readiness::Failed(err.to_string())
            }
        }
    }

    async fn handle(&self) -> Result<StorageHandle> {
        match self.ready().await {
            Readiness::Open { handle, .. } => Ok(handle.clone()),
            Readiness::Failed(reason) => Err(Error::Unavailable(reason.clone())),
        }
    }

    async fn run<T, F>(&self, scope: &'static [Collection], mode: Mode, label: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_>) -> Result<T> + Send + 'static,
    {
        let handle = self.handle().await?;
        tokio::task::spawn_blocking(move || handle.transaction(scope, mode, &label, f))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    // ========== Analyses ==========

    /// Every stored analysis without its file references. Order is unspecified.
    pub async fn list_analyses(&self) -> Result<Vec<AnalysisSummary>> {
        self.run(records::META_SCOPE, Mode::ReadOnly, "listing analyses".to_string(), |tx| {
            records::list_analyses(tx)
        })
        .await
    }

    /// Save an analysis; `None` assigns the next free numeric id. Returns the id.
    pub async fn save_analysis(
        &self,
        id: Option<String>,
        payload: Vec<u8>,
        files: FileReferenceGraph,
        title: &str,
    ) -> Result<String> {
        let title = title.to_string();
        let label = format!("saving analysis {}", id.as_deref().unwrap_or("<new>"));
        let id = self
            .run(records::SCOPE, Mode::ReadWrite, label, move |tx| {
                records::save_analysis(tx, id, payload, files, &title)
            })
            .await?;
        tracing::debug!(id = %id, "saved analysis");
        Ok(id)
    }

    pub async fn load_analysis(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let id = id.to_string();
        self.run(records::SCOPE, Mode::ReadOnly, format!("loading analysis {id}"), move |tx| {
            records::load_analysis(tx, &id)
        })
        .await
    }

    /// Metadata of one analysis including its file references
    pub async fn load_analysis_meta(&self, id: &str) -> Result<Option<AnalysisMeta>> {
        let id = id.to_string();
        self.run(records::META_SCOPE, Mode::ReadOnly, format!("loading analysis metadata {id}"), move |tx| {
            records::load_analysis_meta(tx, &id)
        })
        .await
    }

    /// Remove an analysis and release every file it references.
    pub async fn remove_analysis(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let label = format!("removing analysis {id}");
        let removed = self
            .run(cascade::ANALYSIS_SCOPE, Mode::ReadWrite, label, move |tx| {
                cascade::remove_analysis(tx, &id)
            })
            .await?;
        Ok(removed)
    }

    // ========== Files ==========

    /// Store a file, adding one reference to it.
    pub async fn save_file(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        self.save_file_counted(id, payload).await.map(|_| ())
    }

    /// Like [`KanaDb::save_file`], returning the reference count it committed.
    pub async fn save_file_counted(&self, id: &str, payload: Vec<u8>) -> Result<u32> {
        let owned = id.to_string();
        let count = self
            .run(blob::SCOPE, Mode::ReadWrite, format!("saving file {id}"), move |tx| {
                blob::save_file(tx, &owned, payload)
            })
            .await?;
        tracing::debug!(id, count, "saved file");
        Ok(count)
    }

    pub async fn load_file(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let id = id.to_string();
        self.run(blob::SCOPE, Mode::ReadOnly, format!("loading file {id}"), move |tx| {
            blob::load_file(tx, &id)
        })
        .await
    }

    /// Drop one reference to a file; the last reference deletes it.
    pub async fn remove_file(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(blob::SCOPE, Mode::ReadWrite, format!("removing file {id}"), move |tx| {
            cascade::remove_file(tx, &id)
        })
        .await
    }

    /// Current reference count of a file, `None` if it is not stored
    pub async fn file_ref_count(&self, id: &str) -> Result<Option<u32>> {
        let id = id.to_string();
        self.run(blob::SCOPE, Mode::ReadOnly, format!("reading file metadata {id}"), move |tx| {
            blob::ref_count(tx, &id)
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.run(&Collection::ALL, Mode::ReadOnly, "collecting stats".to_string(), |tx| {
            StoreStats::collect(tx)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_on_empty_store() {
        let db = KanaDb::in_memory();
        assert_eq!(db.initialize().await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_operations_open_the_store_lazily() {
        let db = KanaDb::in_memory();
        db.save_file("f", b"abc".to_vec()).await.unwrap();
        assert_eq!(db.load_file("f").await.unwrap(), Some(b"abc".to_vec()));
        // readiness was resolved by the first operation, before anything was saved
        assert_eq!(db.initialize().await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_clones_share_the_store() {
        let db = KanaDb::in_memory();
        let other = db.clone();
        db.save_file("f", vec![1]).await.unwrap();
        assert_eq!(other.file_ref_count("f").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_save_file_counted_reports_committed_count() {
        let db = KanaDb::in_memory();
        assert_eq!(db.save_file_counted("f", vec![1]).await.unwrap(), 1);
        db.save_file("f", vec![1]).await.unwrap();
        assert_eq!(db.save_file_counted("f", vec![1]).await.unwrap(), 3);
        assert_eq!(db.file_ref_count("f").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_failed_open_surfaces_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let db = KanaDb::new(StoreConfig::with_database(blocker.join("sub").join("k.db")));
        assert_eq!(db.initialize().await, None);

        let err = db.save_file("f", vec![1]).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(matches!(db.list_analyses().await, Err(Error::Unavailable(_))));
    }
}
