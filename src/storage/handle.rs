//! Lifecycle of the underlying SQLite database.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::schema::{self, Collection, SCHEMA_VERSION};
use super::transaction::{Mode, Transaction};
use crate::config::{ensure_db_dir, StoreConfig};
use crate::{Error, Result};

/// What opening did to the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Stored version matched; existing data kept
    Current,
    /// Tables were (re)created empty
    Created { previous_version: i64 },
}

/// Shared handle to the single database connection.
///
/// Cloning is cheap; all clones serialize on the same connection.
#[derive(Clone)]
pub struct StorageHandle {
    conn: Arc<Mutex<Connection>>,
    schema_status: SchemaStatus,
}

impl StorageHandle {
    /// Open the database described by `config` (creates it if missing)
    pub fn open(config: &StoreConfig) -> Result<Self> {
        ensure_db_dir(&config.database)?;
        let conn = Connection::open(&config.database)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn, config.busy_timeout())
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, StoreConfig::default().busy_timeout())
    }

    /// Open a file-backed database with default settings
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(&StoreConfig {
            database: path.to_path_buf(),
            ..StoreConfig::default()
        })
    }

    fn from_connection(mut conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        let schema_status = prepare_schema(&mut conn)?;
        if let SchemaStatus::Created { previous_version } = schema_status {
            tracing::info!(previous_version, version = SCHEMA_VERSION, "created storage schema");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schema_status,
        })
    }

    pub fn schema_status(&self) -> SchemaStatus {
        self.schema_status
    }

    /// Run `f` in a transaction scoped to `scope`; see [`Transaction::run`].
    pub fn transaction<T>(
        &self,
        scope: &[Collection],
        mode: Mode,
        label: &str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Unavailable("storage connection lock poisoned".to_string()))?;
        Transaction::run(&mut conn, scope, mode, label, f)
    }
}

/// Create the tables, dropping everything first when the stored version differs.
fn prepare_schema(conn: &mut Connection) -> Result<SchemaStatus> {
    let stored: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if stored == SCHEMA_VERSION {
        return Ok(SchemaStatus::Current);
    }

    let tx = conn.transaction()?;
    for stmt in schema::drop_statements() {
        tx.execute(&stmt, [])?;
    }
    for stmt in schema::all_schema_statements() {
        tx.execute(stmt, [])?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(SchemaStatus::Created {
        previous_version: stored,
    })
}
