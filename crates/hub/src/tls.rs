//! TLS material and peer identity.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use x509_parser::prelude::*;

use crate::config::TlsFiles;
use crate::HubError;

fn open(path: &Path) -> Result<BufReader<File>, HubError> {
    File::open(path).map(BufReader::new).map_err(|source| HubError::Read { path: path.to_path_buf(), source })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HubError> {
    let mut rd = open(path)?;
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| HubError::Read { path: path.to_path_buf(), source })?;
    if certs.is_empty() {
        return Err(HubError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, HubError> {
    let mut rd = open(path)?;
    rustls_pemfile::private_key(&mut rd)
        .map_err(|source| HubError::Read { path: path.to_path_buf(), source })?
        .ok_or_else(|| HubError::NoPrivateKey(path.to_path_buf()))
}

/// Server config that requires a client certificate chaining to `ca`.
pub fn server_config(
    ca: &[CertificateDer<'static>],
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, HubError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    for cert in ca {
        roots.add(cert.clone())?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| HubError::Verifier(e.to_string()))?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

pub fn load_server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>, HubError> {
    let ca = load_certs(&files.ca)?;
    let chain = load_certs(&files.cert)?;
    let key = load_key(&files.key)?;
    server_config(&ca, chain, key)
}

/// Names the client certificate vouches for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub dns_names: Vec<String>,
    pub uris: Vec<String>,
}

impl PeerIdentity {
    /// Subject alternative names of a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, HubError> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| HubError::Certificate(e.to_string()))?;
        let mut id = PeerIdentity::default();
        let san = cert.subject_alternative_name().map_err(|e| HubError::Certificate(e.to_string()))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(d) => id.dns_names.push(d.to_string()),
                    GeneralName::URI(u) => id.uris.push(u.to_string()),
                    _ => {}
                }
            }
        }
        Ok(id)
    }

    /// Identity of the leaf in a verified peer chain.
    pub fn from_chain(chain: Option<&[CertificateDer<'_>]>) -> Result<Self, HubError> {
        match chain.and_then(|c| c.first()) {
            Some(leaf) => Self::from_der(leaf.as_ref()),
            None => Err(HubError::Certificate("peer presented no certificate".to_string())),
        }
    }

    /// True when a dNSName equals `node_id` or a URI ends in `/<node_id>`.
    pub fn claims(&self, node_id: &str) -> bool {
        if node_id.is_empty() {
            return false;
        }
        self.dns_names.iter().any(|d| d == node_id)
            || self.uris.iter().any(|u| u.trim_end_matches('/').rsplit('/').next() == Some(node_id))
    }
}
