//! mitmlog proxy - intercepting HTTP/HTTPS proxy that logs every request.
//!
//! Clients send absolute-form HTTP requests or open `CONNECT` tunnels. Each
//! observed request is written to the request log before it is forwarded.
//!
//! ## Features
//!
//! - Generates a root CA certificate on first run
//! - Creates per-host certificates on the fly and caches them
//! - Terminates TLS inside `CONNECT` tunnels and logs the decrypted requests
//! - Relays port-80 tunnels as plaintext HTTP, one exchange at a time
//! - Streams bodies in both directions instead of buffering them
//! - Drains live connections on shutdown
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Listener → Dispatcher → CONNECT?
//!                                            │
//!                        ┌───────────────────┴──────────────────┐
//!                        │ No                                   │ Yes
//!                        ▼                                      ▼
//!                 Absolute URI?                           Route Pattern
//!                  │        │                    ┌──────────┼───────────┐
//!                  ▼        ▼                    ▼          ▼           ▼
//!               Log +     500               Plaintext     MITM        502
//!              Forward                        Relay    TLS + Log +
//!                                                        Forward
//! ```

mod ca;
pub mod certs;
pub mod dispatcher;
mod error;
mod handler;
pub mod http1;
pub mod listener;
mod mitm;
mod proxy;
mod recorder;
pub mod relay;
pub mod routing;
pub mod upstream;

pub use ca::{CaManager, CaManagerError, RootAuthority};
pub use certs::{CertificateAuthority, CertificateIssuer, IssuedCertificate, DEFAULT_CACHE_CAPACITY};
pub use dispatcher::{ConnectionSession, SessionKind};
pub use error::{ProxyError, RelayError, Result};
pub use handler::{HandlerConfig, ProxyHandler};
pub use listener::{DrainGroup, DrainGuard, GracefulListener, ListenerState, Shutdown, ShutdownSignal};
pub use mitm::{issue_certificate, serve_intercepted};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use recorder::RequestRecorder;
pub use relay::{relay, relay_until, RelayStats};
pub use routing::{ConnectTarget, Route, RoutePolicy, DEFAULT_MITM_PATTERN, DEFAULT_PLAINTEXT_PATTERN};
pub use upstream::{full_body, BoxError, ProxyBody, TransportMetadata, UpstreamConfig, UpstreamResponse, UpstreamTransport};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
