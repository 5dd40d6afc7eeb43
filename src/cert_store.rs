//! Certificate store for the HTTPS listener
//!
//! Certificates live in one directory as `{domain}.crt` / `{domain}.key`
//! PEM pairs, `*` written as `wildcard`. A self-signed `localhost` pair is
//! generated on first start and serves as the fallback for unknown names.

use crate::error::CertificateError;
use crate::inspect::{self, ExpiryStatus};
use anyhow::Result;
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Name of the generated fallback certificate
pub const DEFAULT_CERT_NAME: &str = "localhost";

/// A certificate flagged by the renewal scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalCandidate {
    pub name: String,
    pub status: ExpiryStatus,
}

/// Directory-backed certificate store with a parsed-key cache
pub struct CertificateStore {
    certs_dir: PathBuf,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl CertificateStore {
    /// Open the store, creating the directory and the default certificate
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)?;

        let store = Self {
            certs_dir,
            cache: DashMap::new(),
        };
        store.ensure_default_cert()?;

        Ok(store)
    }

    fn ensure_default_cert(&self) -> Result<()> {
        if !self.has_certificate(DEFAULT_CERT_NAME) {
            info!("Generating default self-signed certificate");
            self.generate_self_signed(DEFAULT_CERT_NAME, &[DEFAULT_CERT_NAME])?;
        }
        Ok(())
    }

    /// Generate and store a self-signed certificate
    pub fn generate_self_signed(&self, domain: &str, san: &[&str]) -> Result<()> {
        let subject_alt_names: Vec<String> = san.iter().map(|s| s.to_string()).collect();
        let cert = generate_simple_self_signed(subject_alt_names)?;

        self.store_pem(domain, cert.serialize_pem()?.as_bytes(), cert.serialize_private_key_pem().as_bytes())?;
        info!("Generated self-signed certificate for: {}", domain);

        Ok(())
    }

    /// Install a PEM certificate/key pair for `domain`, replacing any cached copy
    pub fn store_pem(&self, domain: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        fs::write(self.cert_path(domain), cert_pem)?;
        fs::write(self.key_path(domain), key_pem)?;
        self.cache.remove(&Self::sanitize_domain(domain));
        Ok(())
    }

    fn sanitize_domain(domain: &str) -> String {
        domain.to_ascii_lowercase().replace('*', "wildcard")
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.crt", Self::sanitize_domain(domain)))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.key", Self::sanitize_domain(domain)))
    }

    pub fn has_certificate(&self, domain: &str) -> bool {
        self.cert_path(domain).exists() && self.key_path(domain).exists()
    }

    /// File stems of every stored certificate, sorted
    pub fn list_certificates(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.certs_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Parsed TLS identity for `domain`, cached after the first load
    pub fn load_certified_key(&self, domain: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let name = Self::sanitize_domain(domain);
        if let Some(key) = self.cache.get(&name) {
            return Ok(key.clone());
        }

        let cert_pem = fs::read(self.cert_path(domain))?;
        let key_pem = fs::read(self.key_path(domain))?;

        let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::KeyMaterial(format!("certificate PEM: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(CertificateError::KeyMaterial(format!("no certificate in {}.crt", name)));
        }

        let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| CertificateError::KeyMaterial(format!("private key PEM: {}", e)))?
            .ok_or_else(|| CertificateError::KeyMaterial(format!("no private key in {}.key", name)))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
            .map_err(|e| CertificateError::KeyMaterial(e.to_string()))?;

        let certified_key = Arc::new(CertifiedKey::new(cert_chain, signing_key));
        self.cache.insert(name, certified_key.clone());

        Ok(certified_key)
    }

    /// Certificate for a TLS server name: exact, then wildcard, then default
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let name = name.trim_end_matches('.');
            if self.has_certificate(name) {
                match self.load_certified_key(name) {
                    Ok(key) => return Some(key),
                    Err(e) => warn!("Failed to load certificate for {}: {}", name, e),
                }
            }

            if let Some((_, parent)) = name.split_once('.') {
                let wildcard = format!("*.{}", parent);
                if self.has_certificate(&wildcard) {
                    match self.load_certified_key(&wildcard) {
                        Ok(key) => return Some(key),
                        Err(e) => warn!("Failed to load certificate for {}: {}", wildcard, e),
                    }
                }
            }
        }

        match self.load_certified_key(DEFAULT_CERT_NAME) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Default certificate unavailable: {}", e);
                None
            }
        }
    }

    /// Drop every parsed identity so the next handshake rereads the files
    pub fn clear_cache(&self) {
        self.cache.clear();
        debug!("Certificate cache cleared");
    }

    /// Classify every stored certificate and report those that need renewal
    pub fn scan_for_renewal(&self) -> Result<Vec<RenewalCandidate>> {
        let mut candidates = Vec::new();

        for name in self.list_certificates()? {
            let path = self.certs_dir.join(format!("{}.crt", name));
            let status = match fs::read(&path) {
                Ok(bytes) => inspect::expiry_status(&bytes),
                Err(e) => {
                    warn!("Cannot read {}: {}", path.display(), e);
                    ExpiryStatus::Unknown
                }
            };

            if status.needs_renewal() {
                warn!("Certificate {} needs renewal ({:?})", name, status);
                candidates.push(RenewalCandidate { name, status });
            }
        }

        self.clear_cache();
        Ok(candidates)
    }

    /// TLS acceptor resolving certificates from this store by SNI
    pub fn tls_acceptor(self: &Arc<Self>) -> TlsAcceptor {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                store: Arc::clone(self),
            }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsAcceptor::from(Arc::new(config))
    }
}

/// rustls hook picking a certificate from the store per ClientHello
pub struct SniResolver {
    store: Arc<CertificateStore>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.store.resolve_name(client_hello.server_name())
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("certs_dir", &self.store.certs_dir)
            .field("cached", &self.store.cache.len())
            .finish()
    }
}

/// Run the renewal scan every `interval`; the first scan happens at startup
pub async fn run_renewal_loop(store: Arc<CertificateStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match store.scan_for_renewal() {
            Ok(candidates) if candidates.is_empty() => debug!("Renewal scan: all certificates valid"),
            Ok(candidates) => info!("Renewal scan: {} certificate(s) need renewal", candidates.len()),
            Err(e) => warn!("Renewal scan failed: {}", e),
        }
    }
}
