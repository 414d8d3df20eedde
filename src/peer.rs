// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Properties learned about the remote side of a TLS handshake, and the
//! helpers that extract them from X509-SVIDs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rustls::pki_types::CertificateDer;
use spiffe::SpiffeId;
use x509_parser::prelude::GeneralName;

use crate::{Error, Result};

/// Leaf certificate of the peer, DER encoded.
pub const PEER_CERT_PROPERTY: &str = "x509_peer_cert";
/// Common name of the leaf certificate subject.
pub const COMMON_NAME_PROPERTY: &str = "x509_common_name";
/// One entry per DNS, URI or IP subject alternative name.
pub const SUBJECT_ALTERNATIVE_NAME_PROPERTY: &str = "x509_subject_alternative_name";
/// SPIFFE id carried in the leaf certificate's URI SAN.
pub const SPIFFE_ID_PROPERTY: &str = "peer_spiffe_id";
/// Application protocol negotiated through ALPN.
pub const ALPN_SELECTED_PROTOCOL_PROPERTY: &str = "ssl_alpn_selected_protocol";

const SUPPORTED_ALPN_VERSIONS: [&[u8]; 2] = [b"grpc-exp", b"h2"];

/// A named value learned during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProperty {
    name: String,
    value: Vec<u8>,
}

impl PeerProperty {
    /// Property name, e.g. [`PEER_CERT_PROPERTY`].
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw property value.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Value as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Everything a handshake learned about the remote side.
///
/// Built by the [`Handshaker`](crate::Handshaker) and consumed by the
/// connector's `check_peer`, which drops it on every exit path.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    properties: Vec<PeerProperty>,
}

impl Peer {
    /// Peer without any properties.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            properties: Vec::new(),
        }
    }

    /// Builder-style [`add_property`](Self::add_property).
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.add_property(name, value);
        self
    }

    /// Append a property. Names may repeat.
    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.properties.push(PeerProperty {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First property called `name`.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PeerProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// All properties, in insertion order.
    #[must_use]
    pub fn properties(&self) -> &[PeerProperty] {
        &self.properties
    }

    /// Build a peer from what a rustls session exposes after the handshake.
    #[must_use]
    pub fn from_session(
        peer_certificates: Option<&[CertificateDer<'_>]>,
        alpn_protocol: Option<&[u8]>,
    ) -> Self {
        let mut peer = Self::new();
        if let Some(leaf) = extract_leaf_cert(peer_certificates) {
            peer.add_property(PEER_CERT_PROPERTY, leaf.as_ref());
            peer.add_certificate_names(leaf);
        }
        if let Some(protocol) = alpn_protocol {
            peer.add_property(ALPN_SELECTED_PROTOCOL_PROPERTY, protocol);
        }
        peer
    }

    fn add_certificate_names(&mut self, leaf: &CertificateDer<'_>) {
        let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf) else {
            return;
        };
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            self.add_property(COMMON_NAME_PROPERTY, cn);
        }
        let Ok(Some(san)) = cert.subject_alternative_name() else {
            return;
        };
        let mut spiffe_id = None;
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => self.add_property(SUBJECT_ALTERNATIVE_NAME_PROPERTY, *dns),
                GeneralName::URI(uri) => {
                    self.add_property(SUBJECT_ALTERNATIVE_NAME_PROPERTY, *uri);
                    if spiffe_id.is_none() {
                        spiffe_id = SpiffeId::try_from(*uri).ok();
                    }
                }
                GeneralName::IPAddress(octets) => {
                    if let Some(ip) = ip_from_octets(octets) {
                        self.add_property(SUBJECT_ALTERNATIVE_NAME_PROPERTY, ip.to_string());
                    }
                }
                _ => {}
            }
        }
        if let Some(id) = spiffe_id {
            self.add_property(SPIFFE_ID_PROPERTY, id.to_string());
        }
    }
}

fn ip_from_octets(octets: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(octets) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(octets)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)))
}

/// Reject peers that did not negotiate a gRPC capable protocol.
///
/// # Errors
/// [`Error::MissingProperty`] when no protocol was negotiated,
/// [`Error::InvalidAlpn`] when it is not `h2` or `grpc-exp`.
pub fn check_alpn(peer: &Peer) -> Result<()> {
    let protocol = peer
        .property(ALPN_SELECTED_PROTOCOL_PROPERTY)
        .ok_or(Error::MissingProperty {
            property: ALPN_SELECTED_PROTOCOL_PROPERTY,
        })?;
    if SUPPORTED_ALPN_VERSIONS.contains(&protocol.value()) {
        Ok(())
    } else {
        Err(Error::InvalidAlpn(
            String::from_utf8_lossy(protocol.value()).into_owned(),
        ))
    }
}

/// Leaf [`CertificateDer`] of a presented chain
#[inline]
#[must_use]
pub fn extract_leaf_cert<'a>(
    peer_certificates: Option<&'a [CertificateDer<'a>]>,
) -> Option<&'a CertificateDer<'a>> {
    peer_certificates?.first()
}

/// Extract a [`SpiffeId`] from a DER certificate if it is a valid X509-SVID
#[inline]
#[must_use]
pub fn extract_spiffe_id(leaf: Option<&[u8]>) -> Option<SpiffeId> {
    let leaf = leaf?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf).ok()?;
    let san = cert.subject_alternative_name().ok()??;
    let uri = san.value.general_names.iter().find_map(|gn| match gn {
        GeneralName::URI(uri) => Some(*uri),
        _ => None,
    })?;
    SpiffeId::try_from(uri).ok()
}
