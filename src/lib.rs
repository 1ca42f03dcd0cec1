//! # KanaDB - embedded store for analysis results
//!
//! KanaDB keeps serialized analysis results next to the input files they were
//! computed from. Input files are shared between analyses and reference
//! counted, so removing an analysis releases exactly the files it pulled in.
//!
//! Storage is a single SQLite database with four tables:
//! - `analysis(id, payload)`
//! - `analysis_meta(id, files, time, title)`
//! - `file(id, payload)`
//! - `file_meta(id, count)`
//!
//! All access goes through [`KanaDb`], which opens the database once and
//! runs every operation as one scoped transaction.

pub mod config;
pub mod db;
pub mod model;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use config::StoreConfig;
pub use db::KanaDb;
pub use model::{AnalysisMeta, AnalysisSummary, FileMeta, FileReference, FileReferenceGraph};
pub use storage::{Collection, StorageHandle, StoreStats};

/// Result type alias for KanaDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for KanaDB operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction failed while {operation} {target}: {code}")]
    Transaction {
        operation: storage::Operation,
        target: String,
        code: String,
    },

    #[error("no {collection} record for {id}")]
    MissingRecord { collection: Collection, id: String },

    #[error("collection {collection} is not part of this transaction")]
    OutOfScope { collection: Collection },

    #[error("cannot write to {collection} in a read-only transaction")]
    ReadOnly { collection: Collection },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("storage task failed: {0}")]
    TaskJoin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_error_message() {
        let err = Error::Transaction {
            operation: storage::Operation::Delete,
            target: "file abc".to_string(),
            code: "ConstraintViolation (2067)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transaction failed while deleting file abc: ConstraintViolation (2067)"
        );
    }

    #[test]
    fn test_missing_record_message() {
        let err = Error::MissingRecord {
            collection: Collection::FileMeta,
            id: "f1".to_string(),
        };
        assert_eq!(err.to_string(), "no file_meta record for f1");
    }
}
