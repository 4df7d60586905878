//! Shared fixtures: a running proxy, local origins and a trusting TLS client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use mitmlog_proxy::http1::{self, RawResponse};
use mitmlog_proxy::{
    CaManager, CertificateAuthority, CertificateIssuer, ProxyConfig, ProxyHandle, ProxyServer,
    RoutePolicy, UpstreamConfig,
};
use mitmlog_storage::Database;
use rustls::pki_types::{CertificateDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;

/// A proxy listening on an ephemeral port with its own CA and log.
pub struct TestProxy {
    pub dir: TempDir,
    pub handle: ProxyHandle,
    pub authority: Arc<CertificateAuthority>,
    pub db: Database,
}

impl TestProxy {
    pub async fn start(routes: RoutePolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::with_path(dir.path().join("log.db")).unwrap();
        Self::start_with(dir, db.clone(), db, routes).await
    }

    /// Starts a proxy writing to `proxy_db`, inspected through `db`.
    pub async fn start_with(dir: TempDir, proxy_db: Database, db: Database, routes: RoutePolicy) -> Self {
        let config = ProxyConfig::with_ca_dir(dir.path().join("ca"))
            .with_port(0)
            .with_routes(routes)
            .with_upstream(UpstreamConfig::default().with_env_proxy(false));

        let server = ProxyServer::new(config, proxy_db).unwrap();
        let authority = server.certificate_authority();
        let handle = server.start().await.unwrap();

        Self {
            dir,
            handle,
            authority,
            db,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }

    pub fn root_der(&self) -> CertificateDer<'static> {
        self.authority.root().cert_der().clone()
    }
}

/// Plain HTTP origin answering every request with `"<METHOD> <target>"`.
pub async fn spawn_http_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_echo(stream));
        }
    });

    addr
}

/// HTTPS origin with a certificate from an unrelated CA.
pub async fn spawn_https_origin() -> SocketAddr {
    let dir = TempDir::new().unwrap();
    let root = CaManager::new(dir.path().join("origin-ca")).ensure_ca().unwrap();
    let cert = CertificateAuthority::new(root).issue("127.0.0.1").unwrap();
    let acceptor = cert.acceptor();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _dir = dir;
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_echo(tls).await;
                }
            });
        }
    });

    addr
}

async fn serve_echo<S>(stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    while let Ok(Some(req)) = http1::read_request(&mut reader).await {
        let body = format!("{} {}", req.method, req.target);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        if write.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Opens a CONNECT tunnel and returns the proxy's reply head and the stream.
pub async fn open_tunnel(proxy: SocketAddr, target: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await.unwrap();

    // Byte at a time so nothing past the head is consumed
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }

    (String::from_utf8(head).unwrap(), stream)
}

/// TLS client trusting only `root`.
pub async fn tls_connect(
    stream: TcpStream,
    root: CertificateDer<'static>,
    server_name: &str,
) -> TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    connector.connect(name, stream).await.unwrap()
}

/// Sends `raw` and reads one response.
pub async fn exchange<S>(stream: &mut BufReader<S>, raw: &str, method: &str) -> RawResponse
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.get_mut().write_all(raw.as_bytes()).await.unwrap();
    stream.get_mut().flush().await.unwrap();
    http1::read_response(stream, method).await.unwrap()
}

/// Body of a buffered response.
pub fn body_of(response: &RawResponse) -> String {
    let text = String::from_utf8_lossy(&response.bytes);
    text.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

/// Route policy relaying exactly `addr` as plaintext and refusing MITM.
pub fn plaintext_only(addr: SocketAddr) -> RoutePolicy {
    let pattern = format!("^{}$", regex::escape(&addr.to_string()));
    RoutePolicy::new(&pattern, "^$").unwrap()
}
