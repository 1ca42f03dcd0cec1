//! Reference-counted file payloads.
//!
//! Each stored file has a `file` row with its bytes and a `file_meta` row with
//! the number of live references. The count is bumped on every save and
//! dropped on every release; the release that takes it to zero removes both rows.

use super::schema::Collection;
use super::transaction::{Transaction, WriteOp};
use crate::model::FileMeta;
use crate::{Error, Result};

/// Collections touched by file operations
pub const SCOPE: &[Collection] = &[Collection::File, Collection::FileMeta];

/// Store `payload` under `id`, adding one reference. Returns the new count.
///
/// An existing payload for `id` is overwritten.
pub fn save_file(tx: &mut Transaction<'_>, id: &str, payload: Vec<u8>) -> Result<u32> {
    let meta = match tx.get_file_meta(id)? {
        Some(mut meta) => {
            meta.count += 1;
            meta
        }
        None => FileMeta::first(id),
    };
    let count = meta.count;

    tx.issue(WriteOp::put_payload(Collection::File, id, payload))?;
    tx.issue(WriteOp::PutFileMeta(meta))?;
    Ok(count)
}

pub fn load_file(tx: &Transaction<'_>, id: &str) -> Result<Option<Vec<u8>>> {
    tx.get_payload(Collection::File, id)
}

pub fn ref_count(tx: &Transaction<'_>, id: &str) -> Result<Option<u32>> {
    Ok(tx.get_file_meta(id)?.map(|meta| meta.count))
}

/// Drop one reference to `id`.
///
/// Returns the writes that apply the release: both deletes when the count
/// reaches zero, otherwise the decremented metadata. The caller schedules
/// them on the same transaction.
pub fn release_file(tx: &Transaction<'_>, id: &str) -> Result<Vec<WriteOp>> {
    let meta = tx.get_file_meta(id)?.ok_or_else(|| Error::MissingRecord {
        collection: Collection::FileMeta,
        id: id.to_string(),
    })?;

    let remaining = meta.count.saturating_sub(1);
    tracing::debug!(id, remaining, "releasing file");

    if remaining == 0 {
        Ok(vec![
            WriteOp::delete(Collection::File, id),
            WriteOp::delete(Collection::FileMeta, id),
        ])
    } else {
        Ok(vec![WriteOp::PutFileMeta(FileMeta {
            id: id.to_string(),
            count: remaining,
        })])
    }
}
