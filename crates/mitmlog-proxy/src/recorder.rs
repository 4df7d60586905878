//! Bridge from intercepted requests to the request log.

use std::net::SocketAddr;

use hyper::header::HOST;
use hyper::http::request::Parts;
use mitmlog_storage::{serialize_headers, Database, NewRequest};

/// Writes one log row per observed request.
#[derive(Debug, Clone)]
pub struct RequestRecorder {
    db: Database,
}

impl RequestRecorder {
    /// Creates a recorder writing to `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying log.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Builds the row for a request head.
    ///
    /// The URL is the request-target as the client sent it. The host comes
    /// from the `Host` header, then the URI authority, then `fallback_host`.
    pub fn entry_for(peer: SocketAddr, parts: &Parts, fallback_host: Option<&str>) -> NewRequest {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .or_else(|| fallback_host.map(str::to_string))
            .unwrap_or_default();

        NewRequest {
            source_ip: peer.ip().to_string(),
            method: parts.method.to_string(),
            host,
            url: parts.uri.to_string(),
            headers: serialize_headers(parts.headers.iter()),
        }
    }

    /// Records `entry`, returning the new row id.
    ///
    /// Failures are reported and swallowed; the caller keeps forwarding.
    pub async fn record(&self, entry: NewRequest) -> Option<i64> {
        let db = self.db.clone();
        let summary = format!("{} {}{}", entry.method, entry.host, entry.url);

        match tokio::task::spawn_blocking(move || db.record(&entry)).await {
            Ok(Ok(id)) => {
                tracing::debug!("Logged request #{}: {}", id, summary);
                Some(id)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to log request {}: {}", summary, e);
                None
            }
            Err(e) => {
                tracing::warn!("Logging task for {} failed: {}", summary, e);
                None
            }
        }
    }
}
