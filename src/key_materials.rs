// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::fmt;

/// A certificate chain and the private key it certifies.
///
/// Both buffers are opaque to this crate and are handed to the
/// [`TlsEngine`](crate::TlsEngine) unmodified. The bundled
/// [`RustlsEngine`](crate::RustlsEngine) accepts PEM or DER.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    cert_chain: Vec<u8>,
    private_key: Vec<u8>,
}

impl KeyCertPair {
    /// Pair a certificate chain with its private key.
    #[must_use]
    pub fn new(cert_chain: impl Into<Vec<u8>>, private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
        }
    }

    /// Certificate chain, leaf first.
    #[must_use]
    pub fn cert_chain(&self) -> &[u8] {
        &self.cert_chain
    }

    /// Private key of the leaf certificate.
    #[must_use]
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }
}

impl fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Root certificates plus the identities a connector presents.
///
/// Always replaced as a whole: callers swap in a fresh value instead of
/// editing roots or pairs in place.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyMaterials {
    root_certs: Option<Vec<u8>>,
    pairs: Vec<KeyCertPair>,
}

impl KeyMaterials {
    /// Bundle root certificates (if any) with certificate/key pairs.
    #[must_use]
    pub fn new(root_certs: Option<Vec<u8>>, pairs: Vec<KeyCertPair>) -> Self {
        Self { root_certs, pairs }
    }

    /// Trust anchors used to verify the peer.
    #[must_use]
    pub fn root_certs(&self) -> Option<&[u8]> {
        self.root_certs.as_deref()
    }

    /// Identities presented to the peer, in configuration order.
    #[must_use]
    pub fn pairs(&self) -> &[KeyCertPair] {
        &self.pairs
    }

    /// `true` when there is no certificate/key pair to build a factory from.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Debug for KeyMaterials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterials")
            .field("has_root_certs", &self.root_certs.is_some())
            .field("pairs", &self.pairs)
            .finish()
    }
}
