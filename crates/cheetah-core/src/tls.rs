//! Hot-swappable TLS identity.
//!
//! The control plane hands out a fresh certificate/key pair every so often. The
//! provider keeps the parsed pair behind a read-write lock and resolves it on every
//! handshake, so a rotation takes effect on the next connection without rebinding.

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Certificate material as delivered by the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub created_at: String,
    pub private_key: String,
    pub certificate: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read PEM data: {0}")]
    Pem(#[from] io::Error),
    #[error("certificate PEM contains no certificates")]
    NoCertificates,
    #[error("private key PEM contains no supported key")]
    NoPrivateKey,
    #[error("private key type is not supported")]
    UnsupportedKey,
}

struct ActiveIdentity {
    created_at: String,
    certified_key: Arc<CertifiedKey>,
}

/// Current certificate/key pair, resolved per handshake.
#[derive(Default)]
pub struct TlsIdentityProvider {
    active: RwLock<Option<Arc<ActiveIdentity>>>,
}

impl fmt::Debug for TlsIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentityProvider")
            .field("created_at", &self.created_at())
            .finish()
    }
}

impl TlsIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in new material unless it carries the creation timestamp already held.
    ///
    /// Returns `Ok(true)` when the active pair changed. Malformed material is logged and
    /// rejected; the previous pair stays active.
    pub fn update(&self, material: &TlsMaterial) -> Result<bool, TlsError> {
        if self.created_at().as_deref() == Some(material.created_at.as_str()) {
            return Ok(false);
        }

        let certified_key = match parse_material(material) {
            Ok(key) => Arc::new(key),
            Err(err) => {
                warn!(target: "cheetah::tls", created_at = %material.created_at, error = %err, "rejected TLS material");
                return Err(err);
            }
        };

        *self.active.write() = Some(Arc::new(ActiveIdentity {
            created_at: material.created_at.clone(),
            certified_key,
        }));
        info!(target: "cheetah::tls", created_at = %material.created_at, "TLS certificate rotated");
        Ok(true)
    }

    pub fn created_at(&self) -> Option<String> {
        self.active
            .read()
            .as_ref()
            .map(|identity| identity.created_at.clone())
    }

    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.active
            .read()
            .as_ref()
            .map(|identity| Arc::clone(&identity.certified_key))
    }

    /// Server configuration with no client authentication, `h2` preferred over
    /// `http/1.1`, and certificate selection deferred to this provider.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }

    pub fn acceptor(self: &Arc<Self>) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config())
    }
}

impl ResolvesServerCert for TlsIdentityProvider {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let key = self.current();
        if key.is_none() {
            warn!(target: "cheetah::tls", "handshake attempted before any certificate was loaded");
        }
        key
    }
}

fn parse_material(material: &TlsMaterial) -> Result<CertifiedKey, TlsError> {
    let chain = rustls_pemfile::certs(&mut material.certificate.as_bytes())?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    let key = read_private_key(material.private_key.as_bytes())?;
    let signing_key = sign::any_supported_type(&key).map_err(|_| TlsError::UnsupportedKey)?;
    Ok(CertifiedKey::new(
        chain.into_iter().map(Certificate).collect(),
        signing_key,
    ))
}

fn read_private_key(mut pem: &[u8]) -> Result<PrivateKey, TlsError> {
    loop {
        match rustls_pemfile::read_one(&mut pem)? {
            Some(Item::PKCS8Key(der)) | Some(Item::RSAKey(der)) | Some(Item::ECKey(der)) => {
                return Ok(PrivateKey(der))
            }
            Some(_) => continue,
            None => return Err(TlsError::NoPrivateKey),
        }
    }
}
