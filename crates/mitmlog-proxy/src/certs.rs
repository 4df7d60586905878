//! Per-host leaf certificates for TLS termination.
//!
//! [`CertificateAuthority`] mints a certificate the first time a host is
//! intercepted and hands out the cached one afterwards. Lookups take a read
//! lock; generation on a miss is serialized per hostname so concurrent
//! sessions to the same host never mint twice.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio_rustls::TlsAcceptor;

use crate::ca::RootAuthority;
use crate::error::CaManagerError;

/// Default number of leaf certificates kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Leaf validity, in days. Some clients reject lifetimes over 398 days.
const LEAF_VALIDITY_DAYS: i64 = 397;

/// Capability to produce a certificate this process can serve as `host`.
pub trait CertificateIssuer: Send + Sync {
    /// Returns a certificate for `host`, reusing a cached one when possible.
    fn issue(&self, host: &str) -> Result<Arc<IssuedCertificate>, CaManagerError>;
}

/// A leaf certificate for one host, ready for a TLS server handshake.
pub struct IssuedCertificate {
    host: String,
    cert_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl IssuedCertificate {
    /// The hostname (or IP literal) the certificate was issued for.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The leaf certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// TLS server configuration presenting this certificate.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Acceptor for the client-facing handshake.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config())
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Bounded map of issued certificates, evicting in insertion order.
#[derive(Default)]
struct LeafCache {
    entries: HashMap<String, Arc<IssuedCertificate>>,
    order: VecDeque<String>,
}

impl LeafCache {
    fn get(&self, host: &str) -> Option<Arc<IssuedCertificate>> {
        self.entries.get(host).cloned()
    }

    fn insert(&mut self, host: String, cert: Arc<IssuedCertificate>, capacity: usize) {
        while self.entries.len() >= capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(host.clone(), cert).is_none() {
            self.order.push_back(host);
        }
    }
}

/// Caching leaf-certificate issuer signed by the local root.
pub struct CertificateAuthority {
    root: RootAuthority,
    provider: Arc<CryptoProvider>,
    cache: RwLock<LeafCache>,
    pending: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    capacity: usize,
    issued: AtomicU64,
}

impl CertificateAuthority {
    /// Creates an issuer with the default cache capacity.
    pub fn new(root: RootAuthority) -> Self {
        Self::with_capacity(root, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates an issuer keeping at most `capacity` certificates.
    pub fn with_capacity(root: RootAuthority, capacity: usize) -> Self {
        Self {
            root,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            cache: RwLock::new(LeafCache::default()),
            pending: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            issued: AtomicU64::new(0),
        }
    }

    /// The root clients must trust.
    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    /// Number of certificates minted so far (cache hits excluded).
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Number of certificates currently cached.
    pub fn cached_count(&self) -> usize {
        self.cache.read().entries.len()
    }

    fn generate(&self, host: &str) -> Result<IssuedCertificate, CaManagerError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.use_authority_key_identifier_extension = true;

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, self.root.issuer())?;
        let cert_der = cert.der().clone();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let chain = vec![cert_der.clone(), self.root.cert_der().clone()];

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Issued certificate for {}", host);

        Ok(IssuedCertificate {
            host: host.to_string(),
            cert_der,
            server_config: Arc::new(config),
        })
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue(&self, host: &str) -> Result<Arc<IssuedCertificate>, CaManagerError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(CaManagerError::Generation("empty hostname".into()));
        }

        if let Some(cert) = self.cache.read().get(&host) {
            return Ok(cert);
        }

        let gate = Arc::clone(self.pending.lock().entry(host.clone()).or_default());
        let _generating = gate.lock();

        // Another session may have minted it while we waited
        if let Some(cert) = self.cache.read().get(&host) {
            return Ok(cert);
        }

        let result = self.generate(&host).map(Arc::new);
        if let Ok(cert) = &result {
            self.cache
                .write()
                .insert(host.clone(), Arc::clone(cert), self.capacity);
        }
        self.pending.lock().remove(&host);

        result
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("capacity", &self.capacity)
            .field("cached", &self.cached_count())
            .field("issued", &self.issued_count())
            .finish()
    }
}

/// Lowercases and strips IPv6 brackets and a trailing root dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}
