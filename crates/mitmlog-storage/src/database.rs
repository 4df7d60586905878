//! High-level database interface.

use std::path::PathBuf;

use tracing::info;

use crate::error::Result;
use crate::models::{LoggedRequest, NewRequest};
use crate::pool::ConnectionPool;
use crate::repository::RequestsRepo;

/// Default location of the request log, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "log.db";

/// Durable, append-only request log.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the log at a specific path.
    ///
    /// The schema is created if it is absent.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Open an existing log for reading only.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        info!("Opening database read-only at: {:?}", path);
        let pool = ConnectionPool::read_only(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    // === Requests ===

    /// Record one observed request in its own transaction.
    ///
    /// Either the row is committed or nothing is visible: a failed insert or
    /// commit rolls the transaction back before the error is returned.
    pub fn record(&self, request: &NewRequest) -> Result<i64> {
        let mut conn = self.pool.get()?;

        let tx = conn.transaction()?;
        let id = RequestsRepo::insert(&tx, request)?;
        tx.commit()?;

        Ok(id)
    }

    /// Get a logged request by ID.
    pub fn get_request(&self, id: i64) -> Result<Option<LoggedRequest>> {
        let conn = self.pool.get()?;
        RequestsRepo::get_by_id(&conn, id)
    }

    /// Get recent requests, newest first.
    pub fn get_recent_requests(&self, limit: i64, offset: i64) -> Result<Vec<LoggedRequest>> {
        let conn = self.pool.get()?;
        RequestsRepo::get_recent(&conn, limit, offset)
    }

    /// Count logged requests.
    pub fn count_requests(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        RequestsRepo::count(&conn)
    }
}
