//! TLS 1.3 control transport.
//!
//! The control channel runs over TLS with a per-process self-signed
//! certificate. TLS provides confidentiality and stream integrity; peer
//! AUTHENTICATION is the handshake engine's job (hybrid signatures over
//! the transcript), so the dialer accepts any certificate rather than
//! trusting a CA. The certificate is therefore pinned by the layer above,
//! not by PKI.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::core::TransportError;
use crate::transport::StreamControlChannel;

/// SNI name used on the overlay; carries no trust.
const TLS_SERVER_NAME: &str = "pqmesh";

/// Control channel over an established TLS session.
pub type TlsControlChannel = StreamControlChannel<TlsStream<TcpStream>>;

fn tls_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(err.to_string())
}

/// Accepts inbound control connections.
pub struct TlsControlListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsControlListener {
    /// Bind a listener with a fresh self-signed certificate.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let certified = rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()])
            .map_err(tls_error)?;
        let cert_der = certified.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        let config =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der.into())
                .map_err(tls_error)?;

        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "control listener up");
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Local listening address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and TLS-wrap the next inbound control connection.
    pub async fn accept(&self) -> Result<TlsControlChannel, TransportError> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr().ok();
        let stream = self.acceptor.accept(tcp).await.map_err(tls_error)?;
        debug!(%peer, "control connection accepted");
        Ok(StreamControlChannel::new(
            TlsStream::Server(stream),
            local,
            Some(peer),
        ))
    }
}

/// Dial a peer's control endpoint.
pub async fn dial_control(addr: SocketAddr) -> Result<TlsControlChannel, TransportError> {
    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedAboveTls))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let local = tcp.local_addr().ok();
    let server_name = ServerName::try_from(TLS_SERVER_NAME).expect("static server name");
    let stream = connector.connect(server_name, tcp).await.map_err(tls_error)?;
    debug!(peer = %addr, "control connection dialed");
    Ok(StreamControlChannel::new(
        TlsStream::Client(stream),
        local,
        Some(addr),
    ))
}

/// Certificate verifier that defers endpoint authentication to the
/// handshake engine. Overlay certificates are self-signed throwaways;
/// the hybrid signature over the handshake transcript is what binds the
/// channel to a peer identity.
#[derive(Debug)]
struct PinnedAboveTls;

impl ServerCertVerifier for PinnedAboveTls {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
