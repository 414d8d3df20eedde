// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use rustls::client::ClientSessionStore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{EngineError, KeyCertPair, Peer};

/// Byte stream a handshaker runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased [`Transport`], before or after the TLS handshake.
pub type BoxedTransport = Box<dyn Transport>;

/// TLS session resumption cache shared by client connectors.
pub type SessionCache = Arc<dyn ClientSessionStore>;

/// Future returned by [`Handshaker::handshake`].
pub type HandshakeFuture =
    Pin<Box<dyn Future<Output = Result<HandshakeOutput, EngineError>> + Send + 'static>>;

/// Server-side policy for requesting and verifying client certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ClientCertRequestType {
    /// Never ask the client for a certificate.
    DontRequest,
    /// Ask for a certificate, accept any (or none).
    RequestButDontVerify,
    /// Ask for a certificate and verify it when one is sent.
    RequestAndVerify,
    /// Require a certificate, accept any.
    RequireButDontVerify,
    /// Require a certificate and verify it against the root certificates.
    #[default]
    RequireAndVerify,
}

impl ClientCertRequestType {
    /// Whether the client must present a certificate.
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::RequireButDontVerify | Self::RequireAndVerify)
    }
}

/// Result of a completed TLS handshake.
pub struct HandshakeOutput {
    /// Encrypted transport, ready for application data.
    pub transport: BoxedTransport,
    /// What the handshake learned about the remote side.
    pub peer: Peer,
}

impl fmt::Debug for HandshakeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOutput")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// One-shot TLS handshake state for a single connection attempt.
pub trait Handshaker: Send + fmt::Debug {
    /// Run the handshake over `transport`.
    fn handshake(self: Box<Self>, transport: BoxedTransport) -> HandshakeFuture;
}

/// Reusable engine built from key material that manufactures
/// [`Handshaker`]s.
pub trait HandshakerFactory: Send + Sync + fmt::Debug {
    /// Create a handshaker. Client factories use `target_name` for SNI and
    /// host name verification; server factories ignore it.
    ///
    /// # Errors
    /// Returns an [`EngineError`] if the handshaker cannot be created, e.g.
    /// because the target name is not a valid server name.
    fn create_handshaker(&self, target_name: Option<&str>)
    -> Result<Box<dyn Handshaker>, EngineError>;
}

/// Builds [`HandshakerFactory`]s from key material.
pub trait TlsEngine: Send + Sync + fmt::Debug {
    /// Build a client factory. `pairs` is never empty.
    ///
    /// # Errors
    /// Returns an [`EngineError`] if the material cannot be used.
    fn build_client(
        &self,
        pairs: &[KeyCertPair],
        root_certs: Option<&[u8]>,
        session_cache: Option<&SessionCache>,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError>;

    /// Build a server factory. `pairs` is never empty.
    ///
    /// # Errors
    /// Returns an [`EngineError`] if the material cannot be used.
    fn build_server(
        &self,
        pairs: &[KeyCertPair],
        root_certs: Option<&[u8]>,
        cert_request: ClientCertRequestType,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError>;
}
