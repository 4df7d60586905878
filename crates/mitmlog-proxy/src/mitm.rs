//! TLS-terminated CONNECT sessions.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::certs::{CertificateIssuer, IssuedCertificate};
use crate::error::{is_disconnect, CaManagerError, ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::listener::ShutdownSignal;
use crate::routing::ConnectTarget;

/// Fetches or mints the certificate for `host` off the async workers.
pub async fn issue_certificate(
    issuer: Arc<dyn CertificateIssuer>,
    host: &str,
) -> std::result::Result<Arc<IssuedCertificate>, CaManagerError> {
    let host = host.to_string();
    tokio::task::spawn_blocking(move || issuer.issue(&host))
        .await
        .map_err(|e| CaManagerError::Generation(e.to_string()))?
}

/// Terminates TLS on `io` and serves the decrypted requests.
///
/// Each request is logged and forwarded by `handler`. Returns once the
/// client closes the tunnel, a read or write fails, or `signal` fires and the
/// exchange in progress has completed.
pub async fn serve_intercepted<IO>(
    io: IO,
    peer: SocketAddr,
    target: ConnectTarget,
    cert: Arc<IssuedCertificate>,
    handler: ProxyHandler,
    mut signal: ShutdownSignal,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls = cert
        .acceptor()
        .accept(io)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    tracing::debug!("TLS established with {} for {}", peer, target);

    let target = Arc::new(target);
    let session_target = Arc::clone(&target);
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let target = Arc::clone(&session_target);
        async move { Ok::<_, Infallible>(handler.forward(peer, req, Some(&target)).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = signal.triggered() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(&e) => {
            tracing::trace!("Client {} left the tunnel to {}: {}", peer, target, e);
            Ok(())
        }
        Err(e) => Err(ProxyError::Http(e.to_string())),
    }
}
