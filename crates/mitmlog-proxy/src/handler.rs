//! HTTP request handler: log, then forward.
//!
//! Used for direct proxy requests and for every request decrypted inside a
//! MITM tunnel.

use std::net::SocketAddr;

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};

use crate::recorder::RequestRecorder;
use crate::routing::ConnectTarget;
use crate::upstream::{full_body, BoxError, ProxyBody, UpstreamTransport};

/// Handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Where observed requests are logged.
    pub recorder: RequestRecorder,
    /// How requests reach their destination.
    pub upstream: UpstreamTransport,
}

/// HTTP handler for the proxy.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    config: HandlerConfig,
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }

    /// The recorder requests are logged through.
    pub fn recorder(&self) -> &RequestRecorder {
        &self.config.recorder
    }

    /// Logs `req`, forwards it upstream and returns the upstream response.
    ///
    /// `tunnel` is the CONNECT target when the request arrived inside a MITM
    /// tunnel; otherwise the request must carry an absolute-form URI. Both
    /// bodies stream through. A failure before the upstream response head
    /// arrives becomes `502 Bad Gateway`.
    pub async fn forward<B>(
        &self,
        peer: SocketAddr,
        req: Request<B>,
        tunnel: Option<&ConnectTarget>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let entry = RequestRecorder::entry_for(peer, &parts, tunnel.map(|t| t.host.as_str()));
        self.config.recorder.record(entry).await;

        let url = upstream_url(&parts.uri, tunnel);
        let body = if body.is_end_stream() {
            None
        } else {
            Some(reqwest::Body::wrap_stream(body.into_data_stream()))
        };

        tracing::debug!("{} {} from {}", parts.method, url, peer);

        match self
            .config
            .upstream
            .round_trip(parts.method, &url, &parts.headers, body)
            .await
        {
            Ok(upstream) => {
                let meta = &upstream.metadata;
                tracing::debug!(
                    "{} answered {} from {:?} over {:?} (tls: {}, peer certificate: {:?} bytes)",
                    url,
                    upstream.response.status(),
                    meta.remote_addr,
                    meta.version,
                    meta.tls,
                    meta.peer_certificate_len
                );
                upstream.response
            }
            Err(e) => {
                tracing::warn!("Upstream request to {} failed: {}", url, e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
            }
        }
    }
}

/// Destination URL for a request.
///
/// Inside a tunnel the origin comes from the CONNECT target and the path
/// from the request-target.
fn upstream_url(uri: &hyper::Uri, tunnel: Option<&ConnectTarget>) -> String {
    match tunnel {
        Some(target) => {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            format!("{}{}", target.https_origin(), path)
        }
        None => uri.to_string(),
    }
}

/// Plain-text response generated by the proxy itself.
pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
