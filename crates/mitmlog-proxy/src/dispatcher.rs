//! Per-connection request dispatch.
//!
//! Every accepted connection is served as HTTP/1.1. `CONNECT` requests are
//! routed to a MITM session or a plaintext relay; absolute-form requests are
//! logged and forwarded directly.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::certs::{CertificateIssuer, IssuedCertificate};
use crate::error::{is_disconnect, ProxyError, Result};
use crate::handler::{text_response, ProxyHandler};
use crate::listener::{DrainGroup, DrainGuard, ShutdownSignal};
use crate::mitm::{issue_certificate, serve_intercepted};
use crate::relay::relay_until;
use crate::routing::{ConnectTarget, Route, RoutePolicy};
use crate::upstream::{full_body, ProxyBody};

/// Body sent to clients that address the proxy as an origin server.
const NOT_A_PROXY_REQUEST: &str =
    "This is a proxy server. Does not respond to non-proxy requests.\n";

/// How one client request is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Absolute-form request forwarded by the proxy.
    Direct,
    /// CONNECT tunnel with TLS termination.
    Mitm,
    /// CONNECT tunnel relayed as plaintext HTTP.
    Plaintext,
}

/// State of one client session: who, how and where to.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    /// Client address.
    pub peer: SocketAddr,
    /// Classification of the session.
    pub kind: SessionKind,
    /// CONNECT destination, for tunnels.
    pub target: Option<ConnectTarget>,
}

impl fmt::Display for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SessionKind::Direct => "direct",
            SessionKind::Mitm => "mitm",
            SessionKind::Plaintext => "plaintext",
        };
        match &self.target {
            Some(target) => write!(f, "{} -> {} ({})", self.peer, target, kind),
            None => write!(f, "{} ({})", self.peer, kind),
        }
    }
}

/// Everything a connection needs to be served.
pub struct ProxyContext {
    routes: RoutePolicy,
    issuer: Arc<dyn CertificateIssuer>,
    handler: ProxyHandler,
    drain: DrainGroup,
    signal: ShutdownSignal,
}

impl ProxyContext {
    /// Creates a context. Tunnels register with `drain` and stop on `signal`.
    pub fn new(
        routes: RoutePolicy,
        issuer: Arc<dyn CertificateIssuer>,
        handler: ProxyHandler,
        drain: DrainGroup,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            routes,
            issuer,
            handler,
            drain,
            signal,
        }
    }

    /// Answers one request read from the client connection.
    pub async fn dispatch(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.connect(peer, req).await;
        }

        if req.uri().scheme().is_none() || req.uri().authority().is_none() {
            tracing::debug!("Non-proxy request from {} for {}", peer, req.uri());
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, NOT_A_PROXY_REQUEST);
        }

        let session = ConnectionSession {
            peer,
            kind: SessionKind::Direct,
            target: None,
        };
        tracing::debug!("Session {}", session);

        self.handler.forward(peer, req, None).await
    }

    async fn connect(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let target = match ConnectTarget::parse(&authority) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("Rejecting CONNECT from {}: {}", peer, e);
                return text_response(StatusCode::BAD_REQUEST, &format!("{}\n", e));
            }
        };

        match self.routes.classify(&target.to_string()) {
            Route::Plaintext => self.open_plaintext(peer, target, req).await,
            Route::Mitm => self.open_mitm(peer, target, req).await,
            Route::Refused => {
                tracing::debug!("No route for CONNECT {} from {}", target, peer);
                text_response(StatusCode::BAD_GATEWAY, "Tunnel target not allowed\n")
            }
        }
    }

    async fn open_plaintext(
        &self,
        peer: SocketAddr,
        target: ConnectTarget,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        // Dial before answering so the client learns about failures
        let upstream = match TcpStream::connect(target.to_string()).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot reach {} for {}: {}", target, peer, e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Cannot reach remote\n");
            }
        };

        let session = ConnectionSession {
            peer,
            kind: SessionKind::Plaintext,
            target: Some(target),
        };
        let guard = self.drain.track();
        let mut signal = self.signal.clone();

        tokio::spawn(async move {
            let _guard: DrainGuard = guard;
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!("HTTP upgrade failed for {}: {}", session, e);
                    return;
                }
            };

            tracing::debug!("Tunnel open {}", session);
            let stop = async move { signal.triggered().await };
            match relay_until(TokioIo::new(upgraded), upstream, stop).await {
                Ok(stats) => tracing::debug!(
                    "Tunnel closed {} after {} exchange(s)",
                    session,
                    stats.exchanges
                ),
                Err(e) => tracing::debug!("Tunnel ended {}: {}", session, e),
            }
        });

        tunnel_established()
    }

    async fn open_mitm(
        &self,
        peer: SocketAddr,
        target: ConnectTarget,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let cert: Arc<IssuedCertificate> =
            match issue_certificate(Arc::clone(&self.issuer), &target.host).await {
                Ok(cert) => cert,
                Err(e) => {
                    tracing::warn!("No certificate for {}: {}", target.host, e);
                    return text_response(StatusCode::BAD_GATEWAY, "Cannot intercept target\n");
                }
            };

        let session = ConnectionSession {
            peer,
            kind: SessionKind::Mitm,
            target: Some(target.clone()),
        };
        let guard = self.drain.track();
        let signal = self.signal.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let _guard: DrainGuard = guard;
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!("HTTP upgrade failed for {}: {}", session, e);
                    return;
                }
            };

            tracing::debug!("Tunnel open {}", session);
            if let Err(e) =
                serve_intercepted(TokioIo::new(upgraded), peer, target, cert, handler, signal).await
            {
                tracing::debug!("Tunnel ended {}: {}", session, e);
            }
        });

        tunnel_established()
    }
}

fn tunnel_established() -> Response<ProxyBody> {
    Response::new(full_body(Bytes::new()))
}

/// Serves every request on one accepted client connection.
///
/// When `signal` fires, the request in progress completes and the
/// connection closes.
pub async fn serve_connection(
    ctx: Arc<ProxyContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut signal = ctx.signal.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(ctx.dispatch(peer, req).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = signal.triggered() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    match result {
        Err(e) if !is_disconnect(&e) => Err(ProxyError::Http(e.to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_display() {
        let session = ConnectionSession {
            peer: "127.0.0.1:5000".parse().unwrap(),
            kind: SessionKind::Mitm,
            target: Some(ConnectTarget::parse("example.com:443").unwrap()),
        };
        assert_eq!(session.to_string(), "127.0.0.1:5000 -> example.com:443 (mitm)");

        let direct = ConnectionSession {
            peer: "127.0.0.1:5000".parse().unwrap(),
            kind: SessionKind::Direct,
            target: None,
        };
        assert_eq!(direct.to_string(), "127.0.0.1:5000 (direct)");
    }

    #[test]
    fn tunnel_established_is_empty_ok() {
        let response = tunnel_established();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
