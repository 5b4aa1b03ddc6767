//! # TLS Transport Layer
//!
//! rustls configuration for mesh endpoints, plus the [`Acceptor`] and
//! [`Dialer`] implementations used by the server, client and bridge.
//!
//! ## Trust Modes (client side)
//! - **Trusted certificate**: a PEM file whose certificates become the only
//!   trust anchors. Mesh peers typically ship one shared `server.crt`.
//! - **Pinned**: accept exactly one certificate by SHA-256 fingerprint,
//!   skipping chain and hostname checks.
//! - **Insecure**: accept anything. Development only.
//!
//! ## Responsibilities
//! - Load certificates and keys from PEM files
//! - Optional mutual TLS on both sides
//! - Self-signed certificate generation for development

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::transport::{Acceptor, BoxedIo, Dialer};

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError(format!("Failed to parse certificate {path}")))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError(format!("No certificates in {path}")));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse PKCS8 private key".into()))?;
    if keys.is_empty() {
        return Err(ProtocolError::TlsError("No private keys found".into()));
    }
    Ok(PrivateKey(keys.swap_remove(0)))
}

fn root_store(certs: &[Certificate]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add trust anchor: {e}")))?;
    }
    Ok(store)
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    /// Optional path to client CA certificates for mTLS
    client_ca_path: Option<String>,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            client_ca_path: None,
        }
    }

    /// Require client certificates signed by the CA at `client_ca_path`
    pub fn with_client_auth<S: Into<String>>(mut self, client_ca_path: S) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self
    }

    /// Generate a self-signed certificate for development/testing purposes
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.key_pair.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    pub fn cert_path(&self) -> &str {
        &self.cert_path
    }

    /// Build the rustls server configuration (TLS 1.2+)
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;
        let builder = ServerConfig::builder().with_safe_defaults();

        let config = match &self.client_ca_path {
            Some(ca_path) => {
                let verifier = rustls::server::AllowAnyAuthenticatedClient::new(root_store(
                    &load_certs(ca_path)?,
                )?);
                debug!("mTLS enabled with client certificate verification required");
                builder
                    .with_client_cert_verifier(Arc::new(verifier))
                    .with_single_cert(cert_chain, private_key)
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, private_key),
        };

        config.map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    /// Build an acceptor for [`crate::server::Server::serve`]
    pub fn acceptor(&self) -> Result<TlsSessionAcceptor> {
        Ok(TlsSessionAcceptor {
            acceptor: TlsAcceptor::from(Arc::new(self.load_server_config()?)),
        })
    }
}

/// How the client decides to trust the server
#[derive(Debug, Clone)]
enum ServerTrust {
    Anchors(String),
    Pinned(Vec<u8>),
    Insecure,
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    trust: ServerTrust,
    client_cert_path: Option<String>,
    client_key_path: Option<String>,
}

impl TlsClientConfig {
    /// Trust only the certificates in `trusted_cert_path`
    pub fn new<S: Into<String>>(server_name: S, trusted_cert_path: S) -> Self {
        Self {
            server_name: server_name.into(),
            trust: ServerTrust::Anchors(trusted_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Accept exactly the certificate with this SHA-256 fingerprint
    pub fn pinned<S: Into<String>>(server_name: S, fingerprint: Vec<u8>) -> Self {
        if fingerprint.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                fingerprint.len()
            );
        }
        Self {
            server_name: server_name.into(),
            trust: ServerTrust::Pinned(fingerprint),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Skip certificate verification entirely
    ///
    /// # WARNING: Security Risk
    /// Only for development and testing.
    pub fn insecure<S: Into<String>>(server_name: S) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        Self {
            server_name: server_name.into(),
            trust: ServerTrust::Insecure,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Present a client certificate for mTLS
    pub fn with_client_certificate<S: Into<String>>(mut self, cert_path: S, key_path: S) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// SHA-256 fingerprint of a certificate, for pinning
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        Sha256::digest(&cert.0).to_vec()
    }

    /// SHA-256 fingerprint of the first certificate in a PEM file
    pub fn fingerprint_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
        let chain = load_certs(&path.as_ref().to_string_lossy())?;
        Ok(Self::calculate_cert_hash(&chain[0]))
    }

    /// Build the rustls client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                Some((load_certs(cert_path)?, load_private_key(key_path)?))
            }
            _ => None,
        };

        // The root-store and custom-verifier builders are distinct types
        let config = match &self.trust {
            ServerTrust::Anchors(path) => {
                let builder = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(root_store(&load_certs(path)?)?);
                match client_auth {
                    Some((chain, key)) => builder.with_client_auth_cert(chain, key),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
            ServerTrust::Pinned(_) | ServerTrust::Insecure => {
                let verifier: Arc<dyn ServerCertVerifier> = match &self.trust {
                    ServerTrust::Pinned(fingerprint) => Arc::new(CertificateFingerprint {
                        fingerprint: fingerprint.clone(),
                    }),
                    _ => Arc::new(AcceptAnyServerCert),
                };
                let builder = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_custom_certificate_verifier(verifier);
                match client_auth {
                    Some((chain, key)) => builder.with_client_auth_cert(chain, key),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
        };

        config.map_err(|e| ProtocolError::TlsError(format!("Failed to build client config: {e}")))
    }

    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    /// Build a dialer for clients and bridge links
    pub fn dialer(&self) -> Result<TlsDialer> {
        Ok(TlsDialer {
            connector: TlsConnector::from(Arc::new(self.load_client_config()?)),
            server_name: self.server_name()?,
        })
    }
}

struct CertificateFingerprint {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for CertificateFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let hash = Sha256::digest(&end_entity.0);
        if hash.as_slice() == self.fingerprint.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Server-side TLS handshake for accepted sockets
#[derive(Clone)]
pub struct TlsSessionAcceptor {
    acceptor: TlsAcceptor,
}

impl Acceptor for TlsSessionAcceptor {
    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, Result<BoxedIo>> {
        let acceptor = self.acceptor.clone();
        Box::pin(async move {
            stream.set_nodelay(true)?;
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
            Ok(Box::new(tls) as BoxedIo)
        })
    }
}

/// Client-side TLS dialer
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    server_name: ServerName,
}

impl TlsDialer {
    #[instrument(skip(connector, server_name), fields(address = %address))]
    async fn connect(
        connector: TlsConnector,
        server_name: ServerName,
        address: String,
    ) -> Result<BoxedIo> {
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;
        debug!("TLS session established");
        Ok(Box::new(tls) as BoxedIo)
    }
}

impl Dialer for TlsDialer {
    fn dial(&self, host: &str, port: u16) -> BoxFuture<'static, Result<BoxedIo>> {
        Box::pin(Self::connect(
            self.connector.clone(),
            self.server_name.clone(),
            format!("{host}:{port}"),
        ))
    }
}
