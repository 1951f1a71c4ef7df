//! Dials and accepts peer connections, optionally TLS-wrapped per
//! [`crate::config::TransportMode`].
//!
//! TLS here provides transport confidentiality/integrity only: a peer's
//! identity is established at the application layer by its self-signed
//! [`abusemesh_core::Node`] event, not by the TLS handshake, so both the
//! client and server verifiers below accept any certificate the other side
//! presents rather than validating a chain against a trusted root (there is
//! no shared CA across independently-operated nodes). `transport = "tls"` is
//! the only mode `NodeConfig::validate` permits outside a dev build;
//! `Insecure` skips the handshake entirely and is dev-gated.

use std::path::Path;
use std::sync::Arc;

use abusemesh_core::Node;
use abusemesh_net::{Connection, RpcError};
use abusemesh_session::{PeerDialer, SessionResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TransportMode;
use crate::error::{NodeError, NodeResult};

/// Any byte stream a [`Connection`] can run over: a plain TCP stream in
/// `dev`-gated [`TransportMode::Insecure`], or a `rustls`-wrapped one
/// otherwise. Boxing lets the accept loop and the peer dialer pick between
/// the two at runtime while `Connection`/`ClientSession` stay generic over a
/// single concrete stream type.
pub trait NodeIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> NodeIo for T {}

pub type NodeStream = Box<dyn NodeIo + Send + Unpin>;

/// Installs the process-wide default crypto provider used by every
/// `rustls::ClientConfig`/`ServerConfig` built below. Idempotent; call once
/// at startup before `transport = "tls"` is exercised.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Accepts any certificate the peer presents. Peer identity is authenticated
/// by the signed `Node` record exchanged over the RPC layer after the
/// handshake, not by certificate-chain validation; rejecting unrecognized
/// CAs here would just mean every node needs a shared root cert distributed
/// out of band, which the mesh has no mechanism for.
#[derive(Debug)]
struct AcceptAnyServerCert(CryptoProvider);

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn client_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth()
}

fn server_tls_config(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> NodeResult<ServerConfig> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|source| NodeError::Tls {
            source: Box::new(source),
        })
}

pub fn load_cert_chain(path: &Path) -> NodeResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub fn load_private_key(path: &Path) -> NodeResult<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let key = rustls_pemfile::private_key(&mut reader)?;
    key.ok_or_else(|| {
        NodeError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no private key found in file",
        ))
    })
}

/// Builds the server-side `TlsAcceptor` for `transport = "tls"` from the
/// configured PEM cert chain and key.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> NodeResult<TlsAcceptor> {
    let cert_chain = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = server_tls_config(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

enum DialMode {
    Plain,
    Tls(TlsConnector),
}

pub struct TcpDialer {
    mode: DialMode,
}

impl TcpDialer {
    pub fn plain() -> Self {
        Self { mode: DialMode::Plain }
    }

    pub fn tls() -> Self {
        Self {
            mode: DialMode::Tls(TlsConnector::from(Arc::new(client_tls_config()))),
        }
    }
}

#[async_trait::async_trait]
impl PeerDialer<NodeStream> for TcpDialer {
    async fn dial(&self, peer: &Node) -> SessionResult<Connection<NodeStream>> {
        let addr: std::net::SocketAddr = peer.listen_addr.parse().map_err(|e: std::net::AddrParseError| {
            RpcError::Connection {
                source: Box::new(e),
            }
        })?;
        let stream = TcpStream::connect(addr).await.map_err(|e| RpcError::Connection {
            source: Box::new(e),
        })?;

        let stream: NodeStream = match &self.mode {
            DialMode::Plain => Box::new(stream),
            DialMode::Tls(connector) => {
                // The verifier above ignores the server name entirely;
                // peers are addressed by socket address, not DNS, so there's
                // no hostname to check against in the first place.
                let name = ServerName::IpAddress(addr.ip().into());
                let tls = connector.connect(name, stream).await.map_err(|e| RpcError::Connection {
                    source: Box::new(e),
                })?;
                Box::new(tls)
            }
        };
        Ok(Connection::new(stream))
    }
}

/// Builds the peer dialer for `mode`: TLS-wrapping outbound connections
/// unless `mode` is the dev-gated `Insecure`.
pub fn dialer(mode: TransportMode) -> Arc<dyn PeerDialer<NodeStream>> {
    match mode {
        TransportMode::Tls => Arc::new(TcpDialer::tls()),
        TransportMode::Insecure => Arc::new(TcpDialer::plain()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `rcgen` generates a throwaway self-signed cert/key pair (same
    /// dev-dependency role it plays in the pack's other TCP+TLS servers),
    /// proving `load_cert_chain`/`load_private_key`/`acceptor` accept real
    /// PEM material end to end.
    #[test]
    fn loads_a_self_signed_cert_and_key() {
        install_default_crypto_provider();
        let cert = rcgen::generate_simple_self_signed(vec!["abusemesh.local".to_string()]).expect("rcgen");
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).expect("write cert");
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).expect("write key");

        let chain = load_cert_chain(&cert_path).expect("load cert chain");
        assert_eq!(chain.len(), 1);
        load_private_key(&key_path).expect("load private key");
        acceptor(&cert_path, &key_path).expect("build acceptor");
    }
}
