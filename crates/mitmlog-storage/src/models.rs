//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed HTTP request, as stored in the log.
///
/// Rows are written once and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedRequest {
    /// Auto-incrementing identifier (reflects commit order).
    pub id: i64,
    /// IP address of the proxy client, without port.
    pub source_ip: String,
    /// Request method.
    pub method: String,
    /// Host the request was addressed to.
    pub host: String,
    /// Request target as the client sent it.
    pub url: String,
    /// `name: value` lines with lowercased names, newline-joined.
    pub headers: String,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// Parameters for recording a new request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRequest {
    /// IP address of the proxy client, without port.
    pub source_ip: String,
    /// Request method.
    pub method: String,
    /// Host the request was addressed to.
    pub host: String,
    /// Request target as the client sent it.
    pub url: String,
    /// Serialized header block (see [`crate::serialize_headers`]).
    pub headers: String,
}
