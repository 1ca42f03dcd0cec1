//! Removal of files and analyses, releasing every file an analysis references.

use super::blob;
use super::records;
use super::schema::Collection;
use super::transaction::{Transaction, WriteOp};
use crate::{Error, Result};

/// Collections touched by an analysis removal
pub const ANALYSIS_SCOPE: &[Collection] = &Collection::ALL;

/// Drop one reference to a file, deleting it when none remain.
pub fn remove_file(tx: &mut Transaction<'_>, id: &str) -> Result<()> {
    let followups = blob::release_file(tx, id)?;
    tx.schedule(followups)
}

/// Remove an analysis and release every file it references.
///
/// The metadata row is deleted last: until all releases are issued it is
/// the only record of which files the analysis holds.
pub fn remove_analysis(tx: &mut Transaction<'_>, id: &str) -> Result<bool> {
    tx.issue(WriteOp::delete(Collection::Analysis, id))?;

    let meta = records::load_analysis_meta(tx, id)?.ok_or_else(|| Error::MissingRecord {
        collection: Collection::AnalysisMeta,
        id: id.to_string(),
    })?;

    let mut released = 0usize;
    for file_id in meta.files.file_ids() {
        // each release reads the count left by the previous one
        let followups = blob::release_file(tx, file_id)?;
        tx.schedule(followups)?;
        released += 1;
    }

    tx.issue(WriteOp::delete(Collection::AnalysisMeta, id))?;
    tracing::debug!(id, released, "analysis removal issued");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileReferenceGraph;
    use crate::storage::{Mode, StorageHandle};

    fn save_file(handle: &StorageHandle, id: &str) {
        handle
            .transaction(blob::SCOPE, Mode::ReadWrite, "save file", |tx| {
                blob::save_file(tx, id, id.as_bytes().to_vec())
            })
            .unwrap();
    }

    fn save_analysis(handle: &StorageHandle, id: &str, files: FileReferenceGraph) {
        for file_id in files.file_ids() {
            save_file(handle, file_id);
        }
        handle
            .transaction(records::SCOPE, Mode::ReadWrite, "save analysis", |tx| {
                records::save_analysis(tx, Some(id.to_string()), vec![0], files, id)
            })
            .unwrap();
    }

    fn ref_count(handle: &StorageHandle, id: &str) -> Option<u32> {
        handle
            .transaction(blob::SCOPE, Mode::ReadOnly, "count", |tx| blob::ref_count(tx, id))
            .unwrap()
    }

    fn remove(handle: &StorageHandle, id: &str) -> Result<bool> {
        handle.transaction(ANALYSIS_SCOPE, Mode::ReadWrite, "remove", |tx| {
            remove_analysis(tx, id)
        })
    }

    #[test]
    fn test_cascade_keeps_shared_and_drops_exclusive() {
        let handle = StorageHandle::open_in_memory().unwrap();
        save_analysis(&handle, "one", FileReferenceGraph::new().with_file("d", "a").with_file("d", "b"));
        save_analysis(&handle, "two", FileReferenceGraph::new().with_file("d", "a"));
        assert_eq!(ref_count(&handle, "a"), Some(2));

        assert!(remove(&handle, "one").unwrap());

        assert_eq!(ref_count(&handle, "a"), Some(1));
        assert_eq!(ref_count(&handle, "b"), None);

        let (payload, meta, file_b) = handle
            .transaction(ANALYSIS_SCOPE, Mode::ReadOnly, "check", |tx| {
                Ok((
                    records::load_analysis(tx, "one")?,
                    records::load_analysis_meta(tx, "one")?,
                    blob::load_file(tx, "b")?,
                ))
            })
            .unwrap();
        assert!(payload.is_none());
        assert!(meta.is_none());
        assert!(file_b.is_none());
    }

    #[test]
    fn test_duplicate_references_release_twice() {
        let handle = StorageHandle::open_in_memory().unwrap();
        let graph = FileReferenceGraph::new()
            .with_file("rna", "shared")
            .with_file("adt", "shared");
        save_analysis(&handle, "dup", graph);
        assert_eq!(ref_count(&handle, "shared"), Some(2));

        remove(&handle, "dup").unwrap();
        assert_eq!(ref_count(&handle, "shared"), None);
    }

    #[test]
    fn test_failed_release_leaves_analysis_intact() {
        let handle = StorageHandle::open_in_memory().unwrap();
        // reference a file that was never saved
        handle
            .transaction(records::SCOPE, Mode::ReadWrite, "save", |tx| {
                records::save_analysis(
                    tx,
                    Some("broken".to_string()),
                    vec![1, 2],
                    FileReferenceGraph::new().with_file("d", "ghost"),
                    "broken",
                )
            })
            .unwrap();

        let err = remove(&handle, "broken").unwrap_err();
        assert!(matches!(err, Error::MissingRecord { .. }));

        let payload = handle
            .transaction(records::SCOPE, Mode::ReadOnly, "load", |tx| {
                records::load_analysis(tx, "broken")
            })
            .unwrap();
        assert_eq!(payload, Some(vec![1, 2]));
    }

    #[test]
    fn test_remove_unknown_analysis_fails() {
        let handle = StorageHandle::open_in_memory().unwrap();
        let err = remove(&handle, "missing").unwrap_err();
        assert!(matches!(
            err,
            Error::MissingRecord { collection: Collection::AnalysisMeta, .. }
        ));
    }

    #[test]
    fn test_remove_file_counts_down() {
        let handle = StorageHandle::open_in_memory().unwrap();
        for _ in 0..3 {
            save_file(&handle, "f");
        }
        for expected in [Some(2), Some(1), None] {
            handle
                .transaction(blob::SCOPE, Mode::ReadWrite, "remove", |tx| remove_file(tx, "f"))
                .unwrap();
            assert_eq!(ref_count(&handle, "f"), expected);
        }
    }
}
