//! Scoped transactions over the four collections.
//!
//! A [`Transaction`] declares up front which collections it touches. Reads
//! return immediately; writes and deletes are issued through [`Transaction::issue`]
//! and leave a [`Completion`] behind. Nothing is committed until
//! [`Transaction::finish`] has seen every completion succeed.
//!
//! Some failures (full disk, I/O errors, out of memory, busy) make SQLite roll
//! back the whole transaction on its own. The transaction is then aborted:
//! further writes are refused and nothing is rolled back a second time.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fmt;

use super::schema::Collection;
use crate::model::{AnalysisMeta, AnalysisSummary, FileMeta, FileReferenceGraph};
use crate::{Error, Result};

/// Whether a transaction may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Kind of storage operation, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Begin,
    Get,
    List,
    Put,
    Delete,
    Commit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Operation::Begin => "starting",
            Operation::Get => "reading",
            Operation::List => "listing",
            Operation::Put => "writing",
            Operation::Delete => "deleting",
            Operation::Commit => "committing",
        };
        f.write_str(verb)
    }
}

/// A write or delete waiting to be issued against a transaction.
///
/// Releasing a file produces a batch of these rather than touching storage
/// itself, so the owning transaction decides when they run.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutPayload {
        collection: Collection,
        id: String,
        payload: Vec<u8>,
    },
    PutFileMeta(FileMeta),
    PutAnalysisMeta {
        id: String,
        files: String,
        time: i64,
        title: String,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl WriteOp {
    pub fn put_payload(collection: Collection, id: &str, payload: Vec<u8>) -> Self {
        WriteOp::PutPayload {
            collection,
            id: id.to_string(),
            payload,
        }
    }

    pub fn put_analysis_meta(meta: &AnalysisMeta) -> Result<Self> {
        Ok(WriteOp::PutAnalysisMeta {
            id: meta.id.clone(),
            files: serde_json::to_string(&meta.files)?,
            time: meta.time,
            title: meta.title.clone(),
        })
    }

    pub fn delete(collection: Collection, id: &str) -> Self {
        WriteOp::Delete {
            collection,
            id: id.to_string(),
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::PutPayload { collection, .. } | WriteOp::Delete { collection, .. } => {
                *collection
            }
            WriteOp::PutFileMeta(_) => Collection::FileMeta,
            WriteOp::PutAnalysisMeta { .. } => Collection::AnalysisMeta,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::PutPayload { id, .. }
            | WriteOp::PutAnalysisMeta { id, .. }
            | WriteOp::Delete { id, .. } => id,
            WriteOp::PutFileMeta(meta) => &meta.id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            WriteOp::Delete { .. } => Operation::Delete,
            _ => Operation::Put,
        }
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<usize> {
        match self {
            WriteOp::PutPayload {
                collection,
                id,
                payload,
            } => conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, payload) VALUES (?1, ?2)",
                    collection.table()
                ),
                params![id, payload],
            ),
            WriteOp::PutFileMeta(meta) => conn.execute(
                "INSERT OR REPLACE INTO file_meta (id, count) VALUES (?1, ?2)",
                params![meta.id, meta.count],
            ),
            WriteOp::PutAnalysisMeta {
                id,
                files,
                time,
                title,
            } => conn.execute(
                "INSERT OR REPLACE INTO analysis_meta (id, files, time, title) VALUES (?1, ?2, ?3, ?4)",
                params![id, files, time, title],
            ),
            WriteOp::Delete { collection, id } => conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", collection.table()),
                [id],
            ),
        }
    }
}

/// Outcome of one issued write or delete
#[derive(Debug, Clone)]
pub struct Completion {
    pub operation: Operation,
    pub collection: Collection,
    pub id: String,
    /// `Err` holds the store's error code
    pub outcome: std::result::Result<(), String>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    fn to_error(&self) -> Option<Error> {
        self.outcome.as_ref().err().map(|code| Error::Transaction {
            operation: self.operation,
            target: format!("{} {}", self.collection, self.id),
            code: code.clone(),
        })
    }
}

/// Every completion issued within one transaction
#[derive(Debug, Default)]
pub struct Pending {
    completions: Vec<Completion>,
}

impl Pending {
    fn record(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    pub fn failures(&self) -> impl Iterator<Item = &Completion> {
        self.completions.iter().filter(|c| !c.succeeded())
    }

    /// Wait-for-all: the number of settled operations, or the first failure.
    pub fn settle(&self) -> Result<usize> {
        match self.failures().find_map(Completion::to_error) {
            Some(err) => Err(err),
            None => Ok(self.completions.len()),
        }
    }
}

/// An open transaction scoped to a fixed set of collections.
pub struct Transaction<'c> {
    tx: rusqlite::Transaction<'c>,
    scope: Vec<Collection>,
    mode: Mode,
    label: String,
    pending: Pending,
    aborted: bool,
}

impl<'c> Transaction<'c> {
    /// Begin a transaction. Read-write transactions take the write lock at once.
    pub fn begin(
        conn: &'c mut Connection,
        scope: &[Collection],
        mode: Mode,
        label: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        let behavior = match mode {
            Mode::ReadOnly => TransactionBehavior::Deferred,
            Mode::ReadWrite => TransactionBehavior::Immediate,
        };
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(|e| Error::Transaction {
                operation: Operation::Begin,
                target: label.clone(),
                code: error_code(&e),
            })?;

        Ok(Self {
            tx,
            scope: scope.to_vec(),
            mode,
            label,
            pending: Pending::default(),
            aborted: false,
        })
    }

    /// Run `f` inside a transaction, then settle and commit.
    ///
    /// Any error from `f` or from an issued operation rolls the whole
    /// transaction back.
    pub fn run<T>(
        conn: &mut Connection,
        scope: &[Collection],
        mode: Mode,
        label: &str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = Transaction::begin(conn, scope, mode, label)?;
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(transaction = label, error = %err, "rolling back transaction");
                return Err(err);
            }
        };
        tx.finish()?;
        Ok(value)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    /// True once the store has rolled the transaction back by itself
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.aborted {
            return Ok(());
        }
        match self.pending.settle() {
            Err(err) => Err(err),
            Ok(_) => Err(Error::Transaction {
                operation: Operation::Commit,
                target: self.label.clone(),
                code: "transaction already rolled back".to_string(),
            }),
        }
    }

    fn check_scope(&self, collection: Collection) -> Result<()> {
        if self.scope.contains(&collection) {
            Ok(())
        } else {
            Err(Error::OutOfScope { collection })
        }
    }

    // ========== Reads ==========

    /// Payload bytes of a file or analysis record
    pub fn get_payload(&self, collection: Collection, id: &str) -> Result<Option<Vec<u8>>> {
        self.check_scope(collection)?;
        debug_assert!(collection.holds_payload());
        self.tx
            .query_row(
                &format!("SELECT payload FROM {} WHERE id = ?1", collection.table()),
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| read_error(Operation::Get, collection, id, &e))
    }

    pub fn get_file_meta(&self, id: &str) -> Result<Option<FileMeta>> {
        self.check_scope(Collection::FileMeta)?;
        self.tx
            .query_row(
                "SELECT id, count FROM file_meta WHERE id = ?1",
                [id],
                |row| {
                    Ok(FileMeta {
                        id: row.get(0)?,
                        count: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| read_error(Operation::Get, Collection::FileMeta, id, &e))
    }

    pub fn get_analysis_meta(&self, id: &str) -> Result<Option<AnalysisMeta>> {
        self.check_scope(Collection::AnalysisMeta)?;
        self.tx
            .query_row(
                "SELECT id, files, time, title FROM analysis_meta WHERE id = ?1",
                [id],
                row_to_analysis_meta,
            )
            .optional()
            .map_err(|e| read_error(Operation::Get, Collection::AnalysisMeta, id, &e))
    }

    /// Every analysis metadata record without its file references
    pub fn list_analysis_summaries(&self) -> Result<Vec<AnalysisSummary>> {
        self.check_scope(Collection::AnalysisMeta)?;
        let list_error = |e: rusqlite::Error| read_error(Operation::List, Collection::AnalysisMeta, "*", &e);

        let mut stmt = self
            .tx
            .prepare("SELECT id, time, title FROM analysis_meta")
            .map_err(list_error)?;
        let summaries = stmt
            .query_map([], |row| {
                Ok(AnalysisSummary {
                    id: row.get(0)?,
                    time: row.get(1)?,
                    title: row.get(2)?,
                })
            })
            .map_err(list_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(list_error)?;

        Ok(summaries)
    }

    pub fn contains(&self, collection: Collection, id: &str) -> Result<bool> {
        self.check_scope(collection)?;
        self.tx
            .query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)",
                    collection.table()
                ),
                [id],
                |row| row.get(0),
            )
            .map_err(|e| read_error(Operation::Get, collection, id, &e))
    }

    pub fn count(&self, collection: Collection) -> Result<u64> {
        self.aggregate(collection, "COUNT(*)")
    }

    /// Total payload size in bytes of a payload collection
    pub fn payload_bytes(&self, collection: Collection) -> Result<u64> {
        debug_assert!(collection.holds_payload());
        self.aggregate(collection, "COALESCE(SUM(LENGTH(payload)), 0)")
    }

    /// Sum of every file reference count
    pub fn total_references(&self) -> Result<u64> {
        self.aggregate(Collection::FileMeta, "COALESCE(SUM(count), 0)")
    }

    fn aggregate(&self, collection: Collection, expr: &str) -> Result<u64> {
        self.check_scope(collection)?;
        let value: i64 = self
            .tx
            .query_row(
                &format!("SELECT {} FROM {}", expr, collection.table()),
                [],
                |row| row.get(0),
            )
            .map_err(|e| read_error(Operation::List, collection, "*", &e))?;
        Ok(value as u64)
    }

    // ========== Writes ==========

    /// Issue a write. Statement failures are recorded, not returned, and
    /// surface from [`Transaction::finish`]. A failure that ended the whole
    /// transaction is returned at once.
    pub fn issue(&mut self, op: WriteOp) -> Result<()> {
        let collection = op.collection();
        self.check_scope(collection)?;
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly { collection });
        }
        self.ensure_active()?;

        let outcome = op.apply(&self.tx).map(|_| ()).map_err(|e| {
            tracing::debug!(
                transaction = %self.label,
                collection = %collection,
                id = op.id(),
                error = %e,
                "operation failed"
            );
            error_code(&e)
        });
        let failed = outcome.is_err();

        self.pending.record(Completion {
            operation: op.operation(),
            collection,
            id: op.id().to_string(),
            outcome,
        });

        if failed && self.tx.is_autocommit() {
            tracing::warn!(transaction = %self.label, "store rolled back transaction");
            self.aborted = true;
            return self.ensure_active();
        }
        Ok(())
    }

    /// Issue a batch of follow-up writes in order
    pub fn schedule(&mut self, ops: impl IntoIterator<Item = WriteOp>) -> Result<()> {
        for op in ops {
            self.issue(op)?;
        }
        Ok(())
    }

    /// Settle every issued operation, then commit. Rolls back on any failure.
    pub fn finish(self) -> Result<()> {
        let Transaction {
            tx, label, pending, ..
        } = self;

        match pending.settle() {
            Ok(settled) => {
                tx.commit().map_err(|e| Error::Transaction {
                    operation: Operation::Commit,
                    target: label.clone(),
                    code: error_code(&e),
                })?;
                tracing::debug!(transaction = %label, settled, "transaction committed");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(transaction = %label, error = %err, "rolling back transaction");
                // dropping an already rolled back transaction is a no-op
                if !tx.is_autocommit() {
                    if let Err(e) = tx.rollback() {
                        tracing::error!(transaction = %label, error = %e, "rollback failed");
                    }
                }
                Err(err)
            }
        }
    }
}

fn row_to_analysis_meta(row: &rusqlite::Row) -> rusqlite::Result<AnalysisMeta> {
    let files_json: String = row.get(1)?;
    let files: FileReferenceGraph = serde_json::from_str(&files_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(AnalysisMeta {
        id: row.get(0)?,
        files,
        time: row.get(2)?,
        title: row.get(3)?,
    })
}

fn read_error(operation: Operation, collection: Collection, id: &str, err: &rusqlite::Error) -> Error {
    Error::Transaction {
        operation,
        target: format!("{} {}", collection, id),
        code: error_code(err),
    }
}

/// SQLite error code name with its extended code, or the error text
pub(crate) fn error_code(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => {
            format!("{:?} ({})", inner.code, inner.extended_code)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, []).unwrap();
        }
        conn
    }

    const FILES: &[Collection] = &[Collection::File, Collection::FileMeta];

    #[test]
    fn test_commit_after_all_operations_succeed() {
        let mut conn = connection();
        Transaction::run(&mut conn, FILES, Mode::ReadWrite, "test", |tx| {
            tx.issue(WriteOp::put_payload(Collection::File, "a", vec![1, 2, 3]))?;
            tx.issue(WriteOp::PutFileMeta(FileMeta::first("a")))?;
            assert_eq!(tx.pending().len(), 2);
            Ok(())
        })
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT count FROM file_meta WHERE id = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failed_operation_rolls_back_everything() {
        let mut conn = connection();
        let err = Transaction::run(&mut conn, FILES, Mode::ReadWrite, "test", |tx| {
            tx.issue(WriteOp::put_payload(Collection::File, "a", vec![1]))?;
            // count = 0 violates the CHECK constraint
            tx.issue(WriteOp::PutFileMeta(FileMeta {
                id: "a".to_string(),
                count: 0,
            }))?;
            // later operations are still attempted
            tx.issue(WriteOp::put_payload(Collection::File, "b", vec![2]))?;
            assert_eq!(tx.pending().len(), 3);
            assert_eq!(tx.pending().failures().count(), 1);
            Ok(())
        })
        .unwrap_err();

        match err {
            Error::Transaction {
                operation, target, code,
            } => {
                assert_eq!(operation, Operation::Put);
                assert_eq!(target, "file_meta a");
                assert!(code.starts_with("ConstraintViolation"), "{code}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let files: i64 = conn
            .query_row("SELECT COUNT(*) FROM file", [], |r| r.get(0))
            .unwrap();
        assert_eq!(files, 0);
    }

    #[test]
    fn test_out_of_scope_collection_is_rejected() {
        let mut conn = connection();
        let mut tx = Transaction::begin(&mut conn, FILES, Mode::ReadWrite, "scoped").unwrap();

        let err = tx
            .issue(WriteOp::delete(Collection::Analysis, "x"))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfScope { collection: Collection::Analysis }));

        let err = tx.get_analysis_meta("x").unwrap_err();
        assert!(matches!(err, Error::OutOfScope { collection: Collection::AnalysisMeta }));
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let mut conn = connection();
        let mut tx = Transaction::begin(&mut conn, FILES, Mode::ReadOnly, "reader").unwrap();
        let err = tx
            .issue(WriteOp::put_payload(Collection::File, "a", vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
        assert!(tx.pending().is_empty());
    }

    #[test]
    fn test_closure_error_discards_issued_writes() {
        let mut conn = connection();
        let result: Result<()> = Transaction::run(&mut conn, FILES, Mode::ReadWrite, "test", |tx| {
            tx.issue(WriteOp::put_payload(Collection::File, "a", vec![1]))?;
            Err(Error::MissingRecord {
                collection: Collection::FileMeta,
                id: "a".to_string(),
            })
        });
        assert!(result.is_err());

        let files: i64 = conn
            .query_row("SELECT COUNT(*) FROM file", [], |r| r.get(0))
            .unwrap();
        assert_eq!(files, 0);
    }

    /// File-backed store that fills up after a few more pages
    fn nearly_full_connection(dir: &tempfile::TempDir) -> Connection {
        let conn = Connection::open(dir.path().join("full.db")).unwrap();
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, []).unwrap();
        }
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0)).unwrap();
        let limit: i64 = conn
            .query_row(&format!("PRAGMA max_page_count = {}", pages + 2), [], |r| r.get(0))
            .unwrap();
        assert_eq!(limit, pages + 2);
        conn
    }

    fn file_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT id FROM file ORDER BY id").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_full_store_rolls_back_whole_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = nearly_full_connection(&dir);

        let err = Transaction::run(&mut conn, FILES, Mode::ReadWrite, "test", |tx| {
            tx.issue(WriteOp::put_payload(Collection::File, "before", vec![1]))?;
            tx.issue(WriteOp::put_payload(Collection::File, "huge", vec![7; 1 << 20]))?;
            tx.issue(WriteOp::put_payload(Collection::File, "after", vec![2]))?;
            Ok(())
        })
        .unwrap_err();

        match err {
            Error::Transaction {
                operation, target, code,
            } => {
                assert_eq!(operation, Operation::Put);
                assert_eq!(target, "file huge");
                assert!(code.starts_with("DiskFull"), "{code}");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(conn.is_autocommit());
        assert!(file_ids(&conn).is_empty());
    }

    #[test]
    fn test_aborted_transaction_refuses_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = nearly_full_connection(&dir);

        let mut tx = Transaction::begin(&mut conn, FILES, Mode::ReadWrite, "test").unwrap();
        tx.issue(WriteOp::put_payload(Collection::File, "before", vec![1]))
            .unwrap();
        let first = tx.issue(WriteOp::put_payload(Collection::File, "huge", vec![7; 1 << 20]));

        if tx.is_aborted() {
            assert!(matches!(first, Err(Error::Transaction { .. })));
            let err = tx
                .issue(WriteOp::put_payload(Collection::File, "after", vec![2]))
                .unwrap_err();
            assert!(matches!(err, Error::Transaction { operation: Operation::Put, .. }));
            assert_eq!(tx.pending().len(), 2);
        } else {
            first.unwrap();
            tx.issue(WriteOp::put_payload(Collection::File, "after", vec![2]))
                .unwrap();
        }

        let err = tx.finish().unwrap_err();
        assert!(matches!(err, Error::Transaction { operation: Operation::Put, .. }));
        assert!(file_ids(&conn).is_empty());
    }

    #[test]
    fn test_delete_of_missing_record_succeeds() {
        let mut conn = connection();
        Transaction::run(&mut conn, FILES, Mode::ReadWrite, "test", |tx| {
            tx.issue(WriteOp::delete(Collection::File, "ghost"))
        })
        .unwrap();
    }
}
