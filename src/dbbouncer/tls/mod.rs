use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::TlsSettings;

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|_| Error::new("failed to parse certificate file"))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|_| Error::new("failed to parse private key file"))?;
    if keys.is_empty() {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        keys = rustls_pemfile::rsa_private_keys(&mut reader).map_err(|_| Error::new("failed to parse RSA private key file"))?;
    }
    keys.pop().map(PrivateKey).ok_or_else(|| Error::new("no private key found in key file"))
}

fn build_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let config =
        ServerConfig::builder().with_safe_defaults().with_no_client_auth().with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Re-reads the certificate/key files from disk whenever their mtime changes,
/// so an operator can rotate a cert without restarting the process. Checked
/// once per accepted connection rather than on a timer — TLS handshakes are
/// infrequent enough relative to cert rotation windows that this adds
/// negligible overhead.
pub struct TlsManager {
    cert_path: PathBuf,
    key_path: PathBuf,
    state: RwLock<(Arc<ServerConfig>, SystemTime)>,
}

impl TlsManager {
    pub fn load(settings: &TlsSettings) -> Result<Option<Self>> {
        if !settings.enabled() {
            return Ok(None);
        }
        let cert_path = settings.cert_path.clone().unwrap();
        let key_path = settings.key_path.clone().unwrap();
        let config = build_server_config(&cert_path, &key_path)?;
        let mtime = std::fs::metadata(&cert_path)?.modified()?;
        info!(cert = %cert_path.display(), "loaded TLS certificate");
        Ok(Some(TlsManager { cert_path, key_path, state: RwLock::new((config, mtime)) }))
    }

    pub async fn acceptor(&self) -> Result<TlsAcceptor> {
        let mtime = std::fs::metadata(&self.cert_path)?.modified()?;
        {
            let state = self.state.read().await;
            if state.1 == mtime {
                return Ok(TlsAcceptor::from(state.0.clone()));
            }
        }
        let config = build_server_config(&self.cert_path, &self.key_path)?;
        let mut state = self.state.write().await;
        *state = (config.clone(), mtime);
        info!(cert = %self.cert_path.display(), "reloaded TLS certificate");
        Ok(TlsAcceptor::from(config))
    }
}
