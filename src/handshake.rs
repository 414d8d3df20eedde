// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{fmt, sync::Arc};

use tokio::sync::oneshot;

use crate::{AuthContext, BoxedTransport, Error, HandshakeOutput, Handshaker, Result, SecurityConnector};

/// Receives the handshakers a [`SecurityConnector`] contributes to a
/// connection attempt.
pub trait HandshakePipeline {
    /// Append a handshaker; handshakers run in insertion order.
    fn add(&mut self, handshaker: SecurityHandshaker);
}

/// A TLS handshaker bound to the connector that checks its peer.
pub struct SecurityHandshaker {
    handshaker: Box<dyn Handshaker>,
    connector: Arc<dyn SecurityConnector>,
}

impl SecurityHandshaker {
    /// Bind `handshaker` to `connector`.
    #[must_use]
    pub fn new(handshaker: Box<dyn Handshaker>, connector: Arc<dyn SecurityConnector>) -> Self {
        Self {
            handshaker,
            connector,
        }
    }

    /// Handshake over `transport`, then wait for the connector's peer check.
    ///
    /// # Errors
    /// The handshake error, or whatever the peer check delivered.
    pub async fn run(self, transport: BoxedTransport) -> Result<SecureTransport> {
        let HandshakeOutput { transport, peer } = self.handshaker.handshake(transport).await?;
        let (tx, rx) = oneshot::channel();
        self.connector.check_peer(
            peer,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let auth_context = rx
            .await
            .map_err(|_| Error::Internal("peer check completion handler dropped".into()))??;
        Ok(SecureTransport {
            transport,
            auth_context,
        })
    }
}

impl fmt::Debug for SecurityHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityHandshaker")
            .field("handshaker", &self.handshaker)
            .field("connector", &self.connector)
            .finish()
    }
}

/// An authenticated transport.
pub struct SecureTransport {
    /// Encrypted byte stream.
    pub transport: BoxedTransport,
    /// Identity of the peer.
    pub auth_context: AuthContext,
}

impl fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTransport")
            .field("auth_context", &self.auth_context)
            .finish_non_exhaustive()
    }
}

/// Sequential [`HandshakePipeline`].
#[derive(Debug, Default)]
pub struct HandshakeManager {
    handshakers: Vec<SecurityHandshaker>,
}

impl HandshakeManager {
    /// Empty pipeline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handshakers: Vec::new(),
        }
    }

    /// Number of handshakers added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handshakers.len()
    }

    /// `true` if no connector contributed a handshaker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handshakers.is_empty()
    }

    /// Run every handshaker in order, each over the output of the previous.
    ///
    /// # Errors
    /// [`Error::FailedPrecondition`] when no handshaker was added (the
    /// connector dropped the attempt), else the first failure.
    pub async fn do_handshake(self, transport: BoxedTransport) -> Result<SecureTransport> {
        let mut handshakers = self.handshakers.into_iter();
        let first = handshakers.next().ok_or_else(|| {
            Error::FailedPrecondition("no security handshaker was added".into())
        })?;
        let mut secured = first.run(transport).await?;
        for handshaker in handshakers {
            secured = handshaker.run(secured.transport).await?;
        }
        Ok(secured)
    }
}

impl HandshakePipeline for HandshakeManager {
    fn add(&mut self, handshaker: SecurityHandshaker) {
        self.handshakers.push(handshaker);
    }
}
