//! Analysis payloads and their metadata.

use super::schema::Collection;
use super::transaction::{Transaction, WriteOp};
use crate::model::{now_millis, AnalysisMeta, AnalysisSummary, FileReferenceGraph};
use crate::Result;

/// Collections touched by analysis saves and loads
pub const SCOPE: &[Collection] = &[Collection::Analysis, Collection::AnalysisMeta];

/// Collection read when listing analyses
pub const META_SCOPE: &[Collection] = &[Collection::AnalysisMeta];

/// Write the payload and metadata of an analysis. Returns the id used.
///
/// Without an `id` a fresh one is chosen inside this transaction, so it
/// cannot collide with a concurrent save.
pub fn save_analysis(
    tx: &mut Transaction<'_>,
    id: Option<String>,
    payload: Vec<u8>,
    files: FileReferenceGraph,
    title: &str,
) -> Result<String> {
    let id = match id {
        Some(id) => id,
        None => next_analysis_id(tx)?,
    };

    let meta = AnalysisMeta {
        id: id.clone(),
        files,
        time: now_millis(),
        title: title.to_string(),
    };

    tx.issue(WriteOp::put_payload(Collection::Analysis, &id, payload))?;
    tx.issue(WriteOp::put_analysis_meta(&meta)?)?;
    Ok(id)
}

/// First unused id, counting up from the number of stored analyses.
fn next_analysis_id(tx: &Transaction<'_>) -> Result<String> {
    let mut next = tx.count(Collection::AnalysisMeta)?;
    loop {
        let candidate = next.to_string();
        if !tx.contains(Collection::AnalysisMeta, &candidate)?
            && !tx.contains(Collection::Analysis, &candidate)?
        {
            return Ok(candidate);
        }
        next += 1;
    }
}

pub fn load_analysis(tx: &Transaction<'_>, id: &str) -> Result<Option<Vec<u8>>> {
    tx.get_payload(Collection::Analysis, id)
}

pub fn load_analysis_meta(tx: &Transaction<'_>, id: &str) -> Result<Option<AnalysisMeta>> {
    tx.get_analysis_meta(id)
}

/// All analyses without their file references. Order is unspecified.
pub fn list_analyses(tx: &Transaction<'_>) -> Result<Vec<AnalysisSummary>> {
    tx.list_analysis_summaries()
}
