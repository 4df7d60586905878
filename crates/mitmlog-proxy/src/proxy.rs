//! Intercepting proxy server.
//!
//! Binds the listener, accepts connections and hands each to the dispatcher
//! on its own task.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mitmlog_storage::Database;

use crate::ca::CaManager;
use crate::certs::{CertificateAuthority, CertificateIssuer, DEFAULT_CACHE_CAPACITY};
use crate::dispatcher::{serve_connection, ProxyContext};
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::listener::{Accepted, DrainGroup, GracefulListener, Shutdown};
use crate::recorder::RequestRecorder;
use crate::routing::RoutePolicy;
use crate::upstream::{UpstreamConfig, UpstreamTransport};
use crate::DEFAULT_PROXY_PORT;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for the root certificate.
    pub ca_manager: CaManager,
    /// CONNECT routing patterns.
    pub routes: RoutePolicy,
    /// Upstream client settings.
    pub upstream: UpstreamConfig,
    /// Maximum number of cached leaf certificates.
    pub cert_cache_capacity: usize,
}

impl ProxyConfig {
    /// Creates a new configuration with default settings.
    ///
    /// The root CA lives in the platform data directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir().map_err(ProxyError::Ca)?;
        Ok(Self::with_ca_manager_defaults(ca_manager))
    }

    /// Default settings with the root CA stored in `ca_dir`.
    pub fn with_ca_dir(ca_dir: impl Into<PathBuf>) -> Self {
        Self::with_ca_manager_defaults(CaManager::new(ca_dir.into()))
    }

    fn with_ca_manager_defaults(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            routes: RoutePolicy::default(),
            upstream: UpstreamConfig::default(),
            cert_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Sets the CONNECT routing patterns.
    pub fn with_routes(mut self, routes: RoutePolicy) -> Self {
        self.routes = routes;
        self
    }

    /// Sets the upstream client settings.
    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Sets the leaf certificate cache capacity.
    pub fn with_cert_cache_capacity(mut self, capacity: usize) -> Self {
        self.cert_cache_capacity = capacity;
        self
    }
}

/// Intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    handler: ProxyHandler,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Creates a proxy server logging to `db`.
    ///
    /// Loads the root CA, generating it first if it is missing.
    pub fn new(config: ProxyConfig, db: Database) -> Result<Self> {
        let root = config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        let authority = Arc::new(CertificateAuthority::with_capacity(
            root,
            config.cert_cache_capacity,
        ));

        let handler = ProxyHandler::new(HandlerConfig {
            recorder: RequestRecorder::new(db),
            upstream: UpstreamTransport::new(&config.upstream)?,
        });

        Ok(Self {
            config,
            authority,
            handler,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// The leaf certificate issuer.
    pub fn certificate_authority(&self) -> Arc<CertificateAuthority> {
        Arc::clone(&self.authority)
    }

    /// Starts the proxy server and serves until the process exits.
    ///
    /// Use [`ProxyServer::start`] to keep a handle for stopping it.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await;
        Ok(())
    }

    /// Binds the listener and serves connections in the background.
    ///
    /// Returns once the socket is bound; a bind failure is returned here.
    /// Dropping the returned handle shuts the proxy down, so keep it for as
    /// long as the proxy should run.
    pub async fn start(self) -> Result<ProxyHandle> {
        let (shutdown, signal) = Shutdown::new();

        let listener = GracefulListener::bind(self.config.addr, signal)
            .await
            .map_err(|e| ProxyError::Proxy(format!("Failed to bind {}: {}", self.config.addr, e)))?;
        let addr = listener.local_addr()?;
        let drain = listener.drain_group().clone();

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let issuer: Arc<dyn CertificateIssuer> = self.authority.clone();
        let ctx = Arc::new(ProxyContext::new(
            self.config.routes.clone(),
            issuer,
            self.handler.clone(),
            drain.clone(),
            shutdown.subscribe(),
        ));

        let handle = tokio::spawn(accept_loop(listener, ctx));

        Ok(ProxyHandle {
            shutdown,
            addr,
            drain,
            handle,
        })
    }
}

async fn accept_loop(mut listener: GracefulListener, ctx: Arc<ProxyContext>) {
    while let Some(accepted) = listener.accept().await {
        match accepted {
            Ok(Accepted { stream, peer, guard }) => {
                tracing::debug!("Accepted connection from {}", peer);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = serve_connection(ctx, stream, peer).await {
                        tracing::debug!("Connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!("Proxy shutdown signal received");
    listener.shutdown().await;
    tracing::info!("Proxy server stopped");
}

/// Handle for controlling a running proxy server.
///
/// The handle owns the shutdown trigger: dropping it stops the proxy the same
/// way [`ProxyHandle::shutdown`] does, and open connections are drained.
#[must_use = "dropping the handle shuts the proxy down"]
pub struct ProxyHandle {
    shutdown: Shutdown,
    addr: SocketAddr,
    drain: DrainGroup,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections and tunnels still open.
    pub fn active_connections(&self) -> usize {
        self.drain.active()
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Waits for the proxy to finish draining.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
