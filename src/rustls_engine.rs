// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! [`TlsEngine`] backed by [`rustls`] and [`tokio_rustls`].

use std::{fmt, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
    client::{Resumption, danger::HandshakeSignatureValid},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{
        CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime, pem::PemObject,
    },
    server::{
        WebPkiClientVerifier,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::{
    BoxedTransport, ClientCertRequestType, EngineError, HandshakeFuture, HandshakeOutput,
    Handshaker, HandshakerFactory, KeyCertPair, Peer, SessionCache, TlsEngine,
};

const ALPN_H2: &[u8] = b"h2";
const PEM_PREAMBLE: &[u8] = b"-----BEGIN";

/// The default [`TlsEngine`]: builds rustls client and server configs.
///
/// Key material may be PEM, or DER: certificates as one or more concatenated
/// DER certificates, keys as PKCS#8. Only the first certificate/key pair is
/// presented; rustls selects a single identity per config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustlsEngine;

impl RustlsEngine {
    /// Create the engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TlsEngine for RustlsEngine {
    fn build_client(
        &self,
        pairs: &[KeyCertPair],
        root_certs: Option<&[u8]>,
        session_cache: Option<&SessionCache>,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError> {
        let roots = root_certs.ok_or_else(|| {
            EngineError::InvalidKeyMaterial("client factory requires root certificates".into())
        })?;
        let roots = build_root_store(roots)?;
        let (cert_chain, private_key) = first_identity(pairs)?;

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, private_key)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        if let Some(cache) = session_cache {
            config.resumption = Resumption::store(Arc::clone(cache));
        }
        Ok(Arc::new(RustlsClientFactory {
            connector: TlsConnector::from(Arc::new(config)),
        }))
    }

    fn build_server(
        &self,
        pairs: &[KeyCertPair],
        root_certs: Option<&[u8]>,
        cert_request: ClientCertRequestType,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError> {
        let builder = ServerConfig::builder();
        let builder = match cert_request {
            ClientCertRequestType::DontRequest => builder.with_no_client_auth(),
            ClientCertRequestType::RequestButDontVerify
            | ClientCertRequestType::RequireButDontVerify => builder.with_client_cert_verifier(
                Arc::new(AnyClientCertVerifier::new(cert_request.is_required())),
            ),
            ClientCertRequestType::RequestAndVerify => {
                let roots = build_root_store(required_roots(root_certs)?)?;
                builder.with_client_cert_verifier(
                    WebPkiClientVerifier::builder(roots)
                        .allow_unauthenticated()
                        .build()?,
                )
            }
            ClientCertRequestType::RequireAndVerify => {
                let roots = build_root_store(required_roots(root_certs)?)?;
                builder.with_client_cert_verifier(WebPkiClientVerifier::builder(roots).build()?)
            }
        };
        let (cert_chain, private_key) = first_identity(pairs)?;
        let mut config = builder.with_single_cert(cert_chain, private_key)?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
        Ok(Arc::new(RustlsServerFactory {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }))
    }
}

fn required_roots(root_certs: Option<&[u8]>) -> Result<&[u8], EngineError> {
    root_certs.ok_or_else(|| {
        EngineError::InvalidKeyMaterial(
            "verifying client certificates requires root certificates".into(),
        )
    })
}

fn first_identity(
    pairs: &[KeyCertPair],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), EngineError> {
    let pair = pairs
        .first()
        .ok_or_else(|| EngineError::InvalidKeyMaterial("no certificate/key pair".into()))?;

    #[cfg(feature = "tracing")]
    if pairs.len() > 1 {
        debug!(ignored = pairs.len() - 1, "presenting the first certificate/key pair only");
    }

    Ok((
        decode_certificates(pair.cert_chain())?,
        decode_private_key(pair.private_key())?,
    ))
}

fn build_root_store(root_certs: &[u8]) -> Result<Arc<RootCertStore>, EngineError> {
    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(decode_certificates(root_certs)?);

    #[cfg(feature = "tracing")]
    debug!(added, ignored);
    #[cfg(not(feature = "tracing"))]
    let _ = (added, ignored);

    if root_store.is_empty() {
        return Err(EngineError::InvalidKeyMaterial(
            "no usable root certificate".into(),
        ));
    }
    Ok(Arc::new(root_store))
}

/// Decode a certificate chain given as PEM or concatenated DER.
///
/// # Errors
/// [`EngineError::InvalidKeyMaterial`] if the bytes hold no certificate or
/// cannot be parsed.
pub fn decode_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let certs = if is_pem(bytes) {
        CertificateDer::pem_slice_iter(bytes)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::InvalidKeyMaterial(format!("malformed PEM certificate: {e}")))?
    } else {
        split_der_certificates(bytes)?
    };
    if certs.is_empty() {
        return Err(EngineError::InvalidKeyMaterial("no certificate found".into()));
    }
    Ok(certs)
}

fn split_der_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let mut certs = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (remaining, _) = x509_parser::parse_x509_certificate(rest).map_err(|e| {
            EngineError::InvalidKeyMaterial(format!("malformed DER certificate: {e}"))
        })?;
        let (cert, _) = rest.split_at(rest.len() - remaining.len());
        certs.push(CertificateDer::from(cert.to_vec()));
        rest = remaining;
    }
    Ok(certs)
}

/// Decode a private key given as PEM, or as PKCS#8 DER.
///
/// # Errors
/// [`EngineError::InvalidKeyMaterial`] if PEM input holds no key.
pub fn decode_private_key(bytes: &[u8]) -> Result<PrivateKeyDer<'static>, EngineError> {
    if is_pem(bytes) {
        PrivateKeyDer::from_pem_slice(bytes)
            .map_err(|e| EngineError::InvalidKeyMaterial(format!("malformed PEM private key: {e}")))
    } else {
        Ok(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(bytes.to_vec())))
    }
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes
        .windows(PEM_PREAMBLE.len())
        .any(|window| window == PEM_PREAMBLE)
}

struct RustlsClientFactory {
    connector: TlsConnector,
}

impl HandshakerFactory for RustlsClientFactory {
    fn create_handshaker(
        &self,
        target_name: Option<&str>,
    ) -> Result<Box<dyn Handshaker>, EngineError> {
        let target_name =
            target_name.ok_or_else(|| EngineError::InvalidServerName(String::new()))?;
        let server_name = ServerName::try_from(target_name.to_owned())
            .map_err(|_| EngineError::InvalidServerName(target_name.to_owned()))?;
        Ok(Box::new(RustlsClientHandshaker {
            connector: self.connector.clone(),
            server_name,
        }))
    }
}

impl fmt::Debug for RustlsClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsClientFactory").finish_non_exhaustive()
    }
}

struct RustlsClientHandshaker {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl Handshaker for RustlsClientHandshaker {
    fn handshake(self: Box<Self>, transport: BoxedTransport) -> HandshakeFuture {
        let Self {
            connector,
            server_name,
        } = *self;
        Box::pin(async move {
            let stream = connector.connect(server_name, transport).await?;
            let (_, session) = stream.get_ref();
            let peer = Peer::from_session(session.peer_certificates(), session.alpn_protocol());
            Ok::<_, EngineError>(HandshakeOutput {
                transport: Box::new(stream),
                peer,
            })
        })
    }
}

impl fmt::Debug for RustlsClientHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsClientHandshaker")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

struct RustlsServerFactory {
    acceptor: TlsAcceptor,
}

impl HandshakerFactory for RustlsServerFactory {
    fn create_handshaker(
        &self,
        _target_name: Option<&str>,
    ) -> Result<Box<dyn Handshaker>, EngineError> {
        Ok(Box::new(RustlsServerHandshaker {
            acceptor: self.acceptor.clone(),
        }))
    }
}

impl fmt::Debug for RustlsServerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsServerFactory").finish_non_exhaustive()
    }
}

struct RustlsServerHandshaker {
    acceptor: TlsAcceptor,
}

impl Handshaker for RustlsServerHandshaker {
    fn handshake(self: Box<Self>, transport: BoxedTransport) -> HandshakeFuture {
        let acceptor = self.acceptor;
        Box::pin(async move {
            let stream = acceptor.accept(transport).await?;
            let (_, session) = stream.get_ref();
            let peer = Peer::from_session(session.peer_certificates(), session.alpn_protocol());
            Ok::<_, EngineError>(HandshakeOutput {
                transport: Box::new(stream),
                peer,
            })
        })
    }
}

impl fmt::Debug for RustlsServerHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsServerHandshaker").finish_non_exhaustive()
    }
}

/// Client certificate verifier for the "don't verify" request types.
///
/// Any chain is accepted; handshake signatures are still checked so the
/// client must hold the key of the certificate it presents. Identity is left
/// to the authorization layer.
#[derive(Debug)]
struct AnyClientCertVerifier {
    mandatory: bool,
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyClientCertVerifier {
    fn new(mandatory: bool) -> Self {
        Self {
            mandatory,
            algorithms: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AnyClientCertVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_detection() {
        assert!(is_pem(b"junk\n-----BEGIN CERTIFICATE-----\n"));
        assert!(!is_pem(&[0x30, 0x82, 0x01, 0x0a]));
    }

    #[test]
    fn garbage_certificates_are_rejected() {
        assert!(matches!(
            decode_certificates(&[0x01, 0x02, 0x03]),
            Err(EngineError::InvalidKeyMaterial(_))
        ));
        assert!(matches!(
            decode_certificates(b""),
            Err(EngineError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn client_requires_roots() {
        let pairs = [KeyCertPair::new(b"chain".to_vec(), b"key".to_vec())];
        let err = RustlsEngine::new()
            .build_client(&pairs, None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn verifying_server_requires_roots() {
        let pairs = [KeyCertPair::new(b"chain".to_vec(), b"key".to_vec())];
        let err = RustlsEngine::new()
            .build_server(&pairs, None, ClientCertRequestType::RequireAndVerify)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidKeyMaterial(_)));
    }
}
