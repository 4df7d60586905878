//! Outbound HTTP(S) round trips for intercepted and direct requests.

use std::convert::Infallible;
use std::net::SocketAddr;

use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Method, Response, Version};

use crate::error::Result;

/// Error type carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the proxy sends to its clients.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body holding `bytes` in full.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

/// Headers that only describe one hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream client settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Honor `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`.
    pub use_env_proxy: bool,
    /// Skip validation of upstream server certificates.
    pub accept_invalid_certs: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            use_env_proxy: true,
            accept_invalid_certs: true,
        }
    }
}

impl UpstreamConfig {
    /// Sets whether environment proxy variables are honored.
    pub fn with_env_proxy(mut self, enabled: bool) -> Self {
        self.use_env_proxy = enabled;
        self
    }

    /// Sets whether upstream certificates are validated.
    pub fn with_certificate_validation(mut self, enabled: bool) -> Self {
        self.accept_invalid_certs = !enabled;
        self
    }
}

/// Facts about the connection a response arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetadata {
    /// Address of the server (or upstream proxy) that answered.
    pub remote_addr: Option<SocketAddr>,
    /// HTTP version of the upstream response.
    pub version: Version,
    /// Whether the upstream leg used TLS.
    pub tls: bool,
    /// DER length of the server's leaf certificate, when TLS was used.
    pub peer_certificate_len: Option<usize>,
}

/// Upstream response plus its transport metadata.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Response with hop-by-hop headers removed. The body streams from the
    /// upstream connection.
    pub response: Response<ProxyBody>,
    /// Connection facts.
    pub metadata: TransportMetadata,
}

/// Performs upstream round trips with a shared connection pool.
#[derive(Debug, Clone)]
pub struct UpstreamTransport {
    client: reqwest::Client,
}

impl UpstreamTransport {
    /// Builds a transport. Redirects are never followed.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .tls_info(true);

        if !config.use_env_proxy {
            builder = builder.no_proxy();
        }

        if config.accept_invalid_certs {
            tracing::debug!("Upstream certificate validation disabled");
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Sends one request and returns once the response head has arrived.
    ///
    /// The response body is passed through as the upstream sends it.
    /// Hop-by-hop headers are dropped from both the request and the response.
    pub async fn round_trip(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<reqwest::Body>,
    ) -> Result<UpstreamResponse> {
        let mut forwarded = headers.clone();
        strip_hop_by_hop(&mut forwarded);

        let mut request = self.client.request(method, url).headers(forwarded);
        if let Some(body) = body {
            request = request.body(body);
        }

        let upstream = request.send().await?;

        let status = upstream.status();
        let version = upstream.version();
        let remote_addr = upstream.remote_addr();
        let peer_certificate_len = upstream
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(<[u8]>::len);
        let tls = upstream.url().scheme() == "https";

        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let body = StreamBody::new(
            upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(BoxError::from),
        );

        let mut response = Response::new(body.boxed_unsync());
        *response.status_mut() = status;
        *response.version_mut() = Version::HTTP_11;
        *response.headers_mut() = response_headers;

        tracing::trace!("Upstream {} answered {} ({:?})", url, status, version);

        Ok(UpstreamResponse {
            response,
            metadata: TransportMetadata {
                remote_addr,
                version,
                tls,
                peer_certificate_len,
            },
        })
    }
}

/// Whether `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
