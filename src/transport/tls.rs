//! The TLS 1.3 listener.
//!
//! Client certificates are requested but never validated: TLS here provides
//! transport encryption and an opaque device identity (a hash of the client
//! cert's SubjectPublicKeyInfo), not a trust anchor. Peer trust flows
//! through the application-layer signature protocol.

use std::sync::{Arc, Once};

use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::crypto::keccak256;
use crate::error::{Error, Result};

use super::{ClientCertDeviceId, TlsIdentity, Transport};

fn ensure_rustls_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Requests a client certificate and accepts whatever arrives, including
/// nothing.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS 1.3-only server config with client certs requested, not required.
pub(super) fn build_tls_server_config(identity: &TlsIdentity) -> Result<rustls::ServerConfig> {
    ensure_rustls_crypto_provider();

    let cert_chain: Vec<CertificateDer<'static>> = identity
        .cert_chain_der
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        identity.private_key_pkcs8_der.clone(),
    ));

    let mut config =
        rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::Internal(format!("bad tls identity: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Device unique id from a client certificate: the Keccak-256 of its
/// SubjectPublicKeyInfo, hex-encoded.
pub(super) fn device_id_from_cert_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    Some(keccak256(cert.public_key().raw).hex())
}

/// Accept loop for the TLS listener. Each connection is served by hyper
/// over the shared router, with the client-cert device id injected into
/// request extensions.
pub(super) async fn run_tls_server(
    transport: Transport,
    listener: TcpListener,
    config: Arc<rustls::ServerConfig>,
    router: axum::Router,
) {
    let acceptor = TlsAcceptor::from(config);
    let mut done = transport.done();

    loop {
        tokio::select! {
            _ = done.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(%err, "error accepting TLS connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            debug!(%remote_addr, %err, "TLS handshake failed");
                            return;
                        }
                    };

                    let device_id = tls_stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .and_then(|cert| device_id_from_cert_der(cert.as_ref()))
                        .map(ClientCertDeviceId);

                    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
                        let router = router.clone();
                        if let Some(id) = &device_id {
                            req.extensions_mut().insert(id.clone());
                        }
                        async move { router.oneshot(req.map(axum::body::Body::new)).await }
                    });

                    let io = TokioIo::new(tls_stream);
                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        debug!(%remote_addr, "TLS connection ended: {err:?}");
                    }
                });
            }
        }
    }
}
