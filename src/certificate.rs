//! Certificate manager for SSL/TLS certificate handling
//!
//! Certificates are provisioned on demand for the SNI name of each
//! handshake, but only for names the [`HostPolicy`] allows. Provisioned
//! certificates are self-signed and cached both in memory and in the
//! cache directory as `<host>.crt` / `<host>.key`.

use crate::error::{Error, Result};
use crate::policy::HostPolicy;
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Certificate manager for handling SSL certificates
pub struct CertificateManager {
    cache_dir: PathBuf,
    policy: HostPolicy,
    certs: DashMap<String, Arc<CertifiedKey>>,
    // Held while a host's certificate files are written and read back
    provisioning: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cache_dir", &self.cache_dir)
            .field("cached", &self.certs.len())
            .finish()
    }
}

impl CertificateManager {
    /// Create a new certificate manager
    pub fn new<P: AsRef<Path>>(cache_dir: P, policy: HostPolicy) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            Error::Certificate(format!("cannot create cache dir {}: {}", cache_dir.display(), e))
        })?;

        Ok(Self {
            cache_dir,
            policy,
            certs: DashMap::new(),
            provisioning: DashMap::new(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// TLS server configuration resolving certificates through this manager
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Certificate for `host`, provisioning one if the policy allows it
    pub fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();
        self.policy.check(&host)?;

        if let Some(key) = self.certs.get(&host) {
            return Ok(key.clone());
        }

        let lock = self.provisioning.entry(host.clone()).or_default().clone();
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(key) = self.certs.get(&host) {
            return Ok(key.clone());
        }

        let key = Arc::new(self.load_or_generate(&host)?);
        self.certs.insert(host, key.clone());
        Ok(key)
    }

    fn load_or_generate(&self, host: &str) -> Result<CertifiedKey> {
        let cert_path = self.cache_dir.join(format!("{}.crt", Self::sanitize_domain(host)));
        let key_path = self.cache_dir.join(format!("{}.key", Self::sanitize_domain(host)));

        if !cert_path.exists() || !key_path.exists() {
            self.generate_self_signed(host, &cert_path, &key_path)?;
        }

        load_certified_key(&cert_path, &key_path)
    }

    /// Generate a self-signed certificate
    fn generate_self_signed(&self, host: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert = generate_simple_self_signed(vec![host.to_string()])
            .map_err(|e| Error::Certificate(format!("generate {}: {}", host, e)))?;

        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| Error::Certificate(format!("serialize {}: {}", host, e)))?;
        let key_pem = cert.serialize_private_key_pem();

        // Key first: a visible certificate always has its key next to it.
        write_atomic(key_path, key_pem.as_bytes())
            .and_then(|_| write_atomic(cert_path, cert_pem.as_bytes()))
            .map_err(|e| Error::Certificate(format!("store {}: {}", host, e)))?;

        info!("Generated self-signed certificate for: {}", host);
        Ok(())
    }

    /// Sanitize domain name for filesystem
    fn sanitize_domain(domain: &str) -> String {
        domain.replace(['/', '\\'], "_").replace('*', "wildcard")
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let Some(host) = client_hello.server_name() else {
            warn!("TLS handshake without SNI refused");
            return None;
        };

        match self.certificate_for(host) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Declined certificate for {}: {}", host, e);
                None
            }
        }
    }
}

/// Write through a temp file in the same directory, then rename into place
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let read_err = |path: &Path, e: std::io::Error| {
        Error::Certificate(format!("read {}: {}", path.display(), e))
    };

    let cert_file = fs::File::open(cert_path).map_err(|e| read_err(cert_path, e))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| read_err(cert_path, e))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!("no certificate in {}", cert_path.display())));
    }

    let key_file = fs::File::open(key_path).map_err(|e| read_err(key_path, e))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| read_err(key_path, e))?
        .ok_or_else(|| Error::Certificate(format!("no private key in {}", key_path.display())))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Certificate(format!("unusable key {}: {}", key_path.display(), e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}
