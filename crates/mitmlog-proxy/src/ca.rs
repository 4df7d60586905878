//! Certificate Authority management for the MITM proxy.
//!
//! Generates and loads the root CA certificate used to sign per-host
//! certificates on the fly.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "mitmlog-ca.crt";
const CA_KEY_FILENAME: &str = "mitmlog-ca.key";

/// Common name of the generated root.
const CA_COMMON_NAME: &str = "mitmlog Root CA";

/// Root validity, in days.
const CA_VALIDITY_DAYS: i64 = 3650;

/// A loaded root: the signing half plus the certificate clients must trust.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

impl RootAuthority {
    /// Builds an authority from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaManagerError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let block = pem::parse(cert_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        if block.tag() != "CERTIFICATE" {
            return Err(CaManagerError::Parse(format!(
                "expected CERTIFICATE block, found {}",
                block.tag()
            )));
        }

        Ok(Self {
            issuer,
            cert_der: CertificateDer::from(block.into_contents()),
            cert_pem: cert_pem.to_string(),
        })
    }

    /// The signer used for leaf certificates.
    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// The root certificate in DER form.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// The root certificate in PEM form.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("", "mitmlog", "mitmlog")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        let ca_dir = project_dirs.data_dir().join("ca");
        Ok(Self::new(ca_dir))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary.
    pub fn ensure_ca(&self) -> Result<RootAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "mitmlog");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;

        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_private(&self.key_path(), &key_pair.serialize_pem())?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key from disk.
    pub fn load_authority(&self) -> Result<RootAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        RootAuthority::from_pem(&cert_pem, &key_pem)
    }

    /// Reads the CA certificate PEM (for installation into client trust stores).
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }
}

/// Writes the private key readable by the owner only.
fn write_private(path: &Path, contents: &str) -> Result<(), CaManagerError> {
    fs::write(path, contents).map_err(|e| CaManagerError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(
            manager.cert_path(),
            PathBuf::from("/tmp/test-ca/mitmlog-ca.crt")
        );
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/tmp/test-ca/mitmlog-ca.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ca_manager_generate_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        assert!(manager.ca_exists());

        let authority = manager.load_authority().unwrap();
        assert!(!authority.cert_der().is_empty());
        assert!(authority.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn ca_manager_ensure_ca_generates_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        assert!(!manager.ca_exists());
        assert!(manager.ensure_ca().is_ok());
        assert!(manager.ca_exists());
    }

    #[test]
    fn ca_manager_ensure_ca_reuses_existing_root() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let first = manager.ensure_ca().unwrap();
        let second = manager.ensure_ca().unwrap();

        assert_eq!(first.cert_der(), second.cert_der());
    }

    #[test]
    fn ca_manager_read_cert_pem() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();

        let pem = manager.read_cert_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn root_authority_rejects_garbage() {
        assert!(RootAuthority::from_pem("not a cert", "not a key").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn ca_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();

        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
