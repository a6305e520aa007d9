//! TLS support for broker connections
//!
//! Loads the trust-anchor bundle that verifies broker certificates and wraps
//! plain TCP sockets in a rustls client session.

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig as RustlsConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// TLS-related errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read trust bundle {path}: {source}")]
    BundleRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("No certificates found in trust bundle {0}")]
    NoCertificates(String),

    #[error("Invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS handshake with {server} failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("TLS configuration error: {0}")]
    ConfigError(#[from] rustls::Error),
}

/// Load trust anchors from a PEM bundle
pub fn load_trust_anchors<P: AsRef<Path>>(path: P) -> Result<RootCertStore, TlsError> {
    let path = path.as_ref();
    let bundle = path.display().to_string();

    let file = File::open(path).map_err(|source| TlsError::BundleRead {
        path: bundle.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(bundle));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unparsable certificates in {}", ignored, bundle);
    }
    if added == 0 {
        return Err(TlsError::NoCertificates(bundle));
    }

    info!("Loaded {} trust anchors from {}", added, bundle);
    Ok(roots)
}

/// Client-side TLS connector verifying brokers against a fixed trust store
#[derive(Clone)]
pub struct BrokerTlsConnector {
    connector: TlsConnector,
}

impl std::fmt::Debug for BrokerTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTlsConnector").finish_non_exhaustive()
    }
}

impl BrokerTlsConnector {
    /// Build a connector from a PEM trust bundle
    pub fn from_bundle<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        Ok(Self::from_root_store(load_trust_anchors(path)?))
    }

    pub fn from_root_store(roots: RootCertStore) -> Self {
        let config = RustlsConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Perform the TLS handshake, using `host` for SNI and certificate verification
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;

        match self.connector.connect(server_name, stream).await {
            Ok(tls_stream) => {
                debug!("TLS handshake with {} completed", host);
                Ok(tls_stream)
            }
            Err(e) => {
                warn!("TLS handshake with {} failed: {}", host, e);
                Err(TlsError::Handshake {
                    server: host.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Plain or TLS-wrapped broker socket
#[allow(clippy::large_enum_variant)]
pub enum BrokerStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            BrokerStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            BrokerStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
