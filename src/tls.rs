//! TLS plumbing for peer-to-peer transfer links.
//!
//! Cluster nodes authenticate each other with single self-signed
//! certificates, so neither side validates a chain: the receiver (server)
//! checks only that a peer certificate is present, and even that check must
//! stay off for peers speaking protocol versions before 7, whose senders
//! hand back a null certificate. The sender (client) accepts any server
//! certificate.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName, StreamOwned,
};
use thiserror::Error;

/// Peer verification ignores names, so connections use a fixed placeholder.
const TLS_SERVER_NAME: &str = "cluster.invalid";

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("pem error: {0}")]
    Pem(String),
    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// DER certificate and private key of the local node.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Load a PEM certificate/key pair from disk.
pub fn load_identity(cert_path: &Path, key_path: &Path) -> Result<TlsIdentity, TlsSetupError> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;
    let cert = pem::parse(cert_pem).map_err(|e| TlsSetupError::Pem(e.to_string()))?;
    let key = pem::parse(key_pem).map_err(|e| TlsSetupError::Pem(e.to_string()))?;
    Ok(TlsIdentity {
        cert_der: cert.contents,
        key_der: key.contents,
    })
}

/// Require the peer to present a certificate, but accept any.
struct RequirePeerCert;

impl ClientCertVerifier for RequirePeerCert {
    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn client_auth_root_subjects(&self) -> Option<rustls::DistinguishedNames> {
        Some(vec![])
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> Option<bool> {
        Some(true)
    }
}

/// Accept any server certificate; identity comes from cluster membership.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Server-side configuration. `require_peer_cert` must stay false for
/// protocol versions before 7.
pub fn server_config(
    identity: &TlsIdentity,
    require_peer_cert: bool,
) -> Result<ServerConfig, TlsSetupError> {
    let certs = vec![Certificate(identity.cert_der.clone())];
    let key = PrivateKey(identity.key_der.clone());
    let builder = ServerConfig::builder().with_safe_defaults();
    let config = if require_peer_cert {
        builder
            .with_client_cert_verifier(Arc::new(RequirePeerCert))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };
    Ok(config)
}

/// Client-side configuration presenting the local identity.
pub fn client_config(identity: &TlsIdentity) -> Result<ClientConfig, TlsSetupError> {
    let certs = vec![Certificate(identity.cert_der.clone())];
    let key = PrivateKey(identity.key_der.clone());
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(RootCertStore::empty())
        .with_single_cert(certs, key)?;
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    Ok(config)
}

/// Run the server-side handshake to completion over a fresh socket.
pub fn accept(
    config: Arc<ServerConfig>,
    mut sock: TcpStream,
) -> io::Result<StreamOwned<ServerConnection, TcpStream>> {
    let mut conn = ServerConnection::new(config)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    sock.set_nodelay(true)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }
    Ok(StreamOwned::new(conn, sock))
}

/// Run the client-side handshake to completion over a fresh socket.
pub fn connect(
    config: Arc<ClientConfig>,
    mut sock: TcpStream,
) -> io::Result<StreamOwned<ClientConnection, TcpStream>> {
    let name = ServerName::try_from(TLS_SERVER_NAME)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut conn = ClientConnection::new(config, name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    sock.set_nodelay(true)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }
    Ok(StreamOwned::new(conn, sock))
}

/// A transfer link: plain TCP or one of the TLS stream directions.
pub enum Conn {
    Tcp(TcpStream),
    TlsServer(StreamOwned<ServerConnection, TcpStream>),
    TlsClient(StreamOwned<ClientConnection, TcpStream>),
}

impl Conn {
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            Conn::Tcp(sock) => sock,
            Conn::TlsServer(stream) => &stream.sock,
            Conn::TlsClient(stream) => &stream.sock,
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.tcp_stream().shutdown(Shutdown::Both)
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(sock) => sock.read(buf),
            Conn::TlsServer(stream) => stream.read(buf),
            Conn::TlsClient(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(sock) => sock.write(buf),
            Conn::TlsServer(stream) => stream.write(buf),
            Conn::TlsClient(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(sock) => sock.flush(),
            Conn::TlsServer(stream) => stream.flush(),
            Conn::TlsClient(stream) => stream.flush(),
        }
    }
}
