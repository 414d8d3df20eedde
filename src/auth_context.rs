// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use spiffe::SpiffeId;

use crate::peer::{
    ALPN_SELECTED_PROTOCOL_PROPERTY, COMMON_NAME_PROPERTY, PEER_CERT_PROPERTY, Peer, PeerProperty,
    SPIFFE_ID_PROPERTY, SUBJECT_ALTERNATIVE_NAME_PROPERTY,
};

/// Transport security type recorded on every context built here.
pub const SPIFFE_TRANSPORT_SECURITY_TYPE: &str = "spiffe";

const COPIED_PROPERTIES: [&str; 5] = [
    PEER_CERT_PROPERTY,
    COMMON_NAME_PROPERTY,
    SUBJECT_ALTERNATIVE_NAME_PROPERTY,
    SPIFFE_ID_PROPERTY,
    ALPN_SELECTED_PROTOCOL_PROPERTY,
];

/// Authenticated identity of a peer, attached to the connection after a
/// successful `check_peer`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    transport_security_type: &'static str,
    peer_identity_property_name: Option<&'static str>,
    properties: Vec<PeerProperty>,
}

impl AuthContext {
    /// Copy the identity related properties out of `peer`.
    ///
    /// The peer identity is the subject alternative names when present,
    /// otherwise the subject common name.
    #[must_use]
    pub fn from_peer(peer: &Peer) -> Self {
        let properties: Vec<PeerProperty> = peer
            .properties()
            .iter()
            .filter(|p| COPIED_PROPERTIES.contains(&p.name()))
            .cloned()
            .collect();
        let has = |name: &str| properties.iter().any(|p| p.name() == name);
        let peer_identity_property_name = if has(SUBJECT_ALTERNATIVE_NAME_PROPERTY) {
            Some(SUBJECT_ALTERNATIVE_NAME_PROPERTY)
        } else if has(COMMON_NAME_PROPERTY) {
            Some(COMMON_NAME_PROPERTY)
        } else {
            None
        };
        Self {
            transport_security_type: SPIFFE_TRANSPORT_SECURITY_TYPE,
            peer_identity_property_name,
            properties,
        }
    }

    /// Always [`SPIFFE_TRANSPORT_SECURITY_TYPE`].
    #[must_use]
    pub const fn transport_security_type(&self) -> &'static str {
        self.transport_security_type
    }

    /// Name of the property holding the peer identity, if the peer has one.
    #[must_use]
    pub const fn peer_identity_property_name(&self) -> Option<&'static str> {
        self.peer_identity_property_name
    }

    /// Values of the peer identity property.
    pub fn peer_identity(&self) -> impl Iterator<Item = &str> {
        let name = self.peer_identity_property_name;
        self.properties
            .iter()
            .filter(move |p| Some(p.name()) == name)
            .filter_map(PeerProperty::value_str)
    }

    /// Properties whose name is `name`.
    pub fn find_properties<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PeerProperty> {
        self.properties.iter().filter(move |p| p.name() == name)
    }

    /// Parsed SPIFFE id of the peer.
    #[must_use]
    pub fn spiffe_id(&self) -> Option<SpiffeId> {
        self.find_properties(SPIFFE_ID_PROPERTY)
            .find_map(PeerProperty::value_str)
            .and_then(|id| SpiffeId::try_from(id).ok())
    }

    /// Whether the authenticated peer is valid for `host`.
    ///
    /// DNS and IP subject alternative names are compared first; the common
    /// name is consulted only when the certificate has no SAN at all.
    #[must_use]
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return false;
        }
        let mut has_san = false;
        for san in self
            .find_properties(SUBJECT_ALTERNATIVE_NAME_PROPERTY)
            .filter_map(PeerProperty::value_str)
        {
            has_san = true;
            if name_matches(san, host) {
                return true;
            }
        }
        !has_san
            && self
                .find_properties(COMMON_NAME_PROPERTY)
                .filter_map(PeerProperty::value_str)
                .any(|cn| name_matches(cn, host))
    }
}

/// Case insensitive match of `host` against a certificate name, allowing a
/// single leading `*.` label that never matches across dots.
fn name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    if pattern.contains("://") {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if suffix.is_empty() || suffix.contains('*') {
            return false;
        }
        let Some((label, rest)) = host.split_once('.') else {
            return false;
        };
        return !label.is_empty() && rest.eq_ignore_ascii_case(suffix);
    }
    pattern.eq_ignore_ascii_case(host)
}
