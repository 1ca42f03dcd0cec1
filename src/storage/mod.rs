//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - analysis(id, payload)
//! - analysis_meta(id, files, time, title)
//! - file(id, payload)
//! - file_meta(id, count)

pub mod blob;
pub mod cascade;
pub mod handle;
pub mod records;
pub mod schema;
pub mod transaction;

pub use handle::{SchemaStatus, StorageHandle};
pub use schema::{Collection, SCHEMA_VERSION};
pub use transaction::{Completion, Mode, Operation, Pending, Transaction, WriteOp};

use crate::Result;

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub analyses: u64,
    pub files: u64,
    pub file_bytes: u64,
    pub analysis_bytes: u64,
    /// Sum of all file reference counts
    pub references: u64,
}

impl StoreStats {
    pub fn collect(tx: &Transaction<'_>) -> Result<Self> {
        Ok(Self {
            analyses: tx.count(Collection::AnalysisMeta)?,
            files: tx.count(Collection::FileMeta)?,
            file_bytes: tx.payload_bytes(Collection::File)?,
            analysis_bytes: tx.payload_bytes(Collection::Analysis)?,
            references: tx.total_references()?,
        })
    }
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Analyses: {} ({} bytes)", self.analyses, self.analysis_bytes)?;
        writeln!(f, "  Files: {} ({} bytes)", self.files, self.file_bytes)?;
        writeln!(f, "  References: {}", self.references)
    }
}
