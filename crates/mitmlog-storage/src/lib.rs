//! mitmlog storage - SQLite request log.
//!
//! Every HTTP request the proxy observes is appended to a `requests` table,
//! one transaction per row. Rows are never updated or deleted.
//!
//! # Example
//!
//! ```no_run
//! use mitmlog_storage::{serialize_headers, Database, NewRequest};
//!
//! let db = Database::with_path("log.db").unwrap();
//!
//! db.record(&NewRequest {
//!     source_ip: "127.0.0.1".to_string(),
//!     method: "GET".to_string(),
//!     host: "example.com".to_string(),
//!     url: "/".to_string(),
//!     headers: serialize_headers([("Accept", "*/*")]),
//! })
//! .unwrap();
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, DEFAULT_DB_PATH};
pub use error::{Result, StorageError};
pub use models::{LoggedRequest, NewRequest};
pub use pool::ConnectionPool;
pub use repository::{serialize_headers, RequestsRepo, HEADER_SEPARATOR};
