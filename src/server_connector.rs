// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{cmp::Ordering, fmt, sync::Arc};

#[cfg(feature = "tracing")]
use tracing::error;

use crate::{
    AuthContext, HandshakePipeline, OnPeerChecked, Peer, Result, SecurityConnector,
    SecurityHandshaker, TlsCredentialsOptions,
    connector::{SSL_URL_SCHEME, cmp_credentials},
    factory::{FactorySide, HandshakerFactoryManager},
    peer::check_alpn,
};

/// Server credentials backed by [`TlsCredentialsOptions`].
#[derive(Debug, Clone)]
pub struct SpiffeServerCredentials {
    options: Arc<TlsCredentialsOptions>,
}

impl SpiffeServerCredentials {
    /// Wrap `options`.
    #[must_use]
    pub fn new(options: TlsCredentialsOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    /// Options every connector of these credentials shares.
    #[must_use]
    pub fn options(&self) -> &TlsCredentialsOptions {
        &self.options
    }

    /// Create a connector for a listener.
    ///
    /// # Errors
    /// Whatever the first handshaker factory build reports.
    pub fn create_security_connector(&self) -> Result<Arc<SpiffeServerSecurityConnector>> {
        SpiffeServerSecurityConnector::create(Arc::clone(&self.options))
    }
}

/// Server side SPIFFE security connector.
///
/// Verifies client certificates according to the configured
/// [`ClientCertRequestType`](crate::ClientCertRequestType); no external
/// authorization step runs on this side.
pub struct SpiffeServerSecurityConnector {
    options: Arc<TlsCredentialsOptions>,
    factory: HandshakerFactoryManager,
}

impl SpiffeServerSecurityConnector {
    fn create(options: Arc<TlsCredentialsOptions>) -> Result<Arc<Self>> {
        let connector = Self {
            factory: HandshakerFactoryManager::new(
                Arc::clone(&options),
                FactorySide::Server {
                    cert_request: options.cert_request_type(),
                },
            ),
            options,
        };
        if let Err(err) = connector.factory.initialize() {
            #[cfg(feature = "tracing")]
            error!(%err, "could not initialize server handshaker factory");
            return Err(err);
        }
        Ok(Arc::new(connector))
    }

    /// Version of the live handshaker factory.
    #[must_use]
    pub fn factory_version(&self) -> Option<u64> {
        self.factory.version()
    }
}

impl SecurityConnector for SpiffeServerSecurityConnector {
    fn url_scheme(&self) -> &'static str {
        SSL_URL_SCHEME
    }

    fn add_handshakers(self: Arc<Self>, pipeline: &mut dyn HandshakePipeline) {
        if let Err(_err) = self.factory.refresh() {
            #[cfg(feature = "tracing")]
            error!(err = %_err, "handshaker factory refresh failed");
            return;
        }
        match self.factory.create_handshaker(None) {
            Ok(handshaker) => pipeline.add(SecurityHandshaker::new(handshaker, self)),
            Err(_err) => {
                #[cfg(feature = "tracing")]
                error!(err = %_err, "handshaker creation failed");
            }
        }
    }

    fn check_peer(&self, peer: Peer, on_peer_checked: OnPeerChecked) {
        let result = check_alpn(&peer).map(|()| AuthContext::from_peer(&peer));
        drop(peer);
        on_peer_checked(result);
    }
}

impl PartialEq for SpiffeServerSecurityConnector {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SpiffeServerSecurityConnector {}

impl PartialOrd for SpiffeServerSecurityConnector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpiffeServerSecurityConnector {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_credentials(
            self.url_scheme(),
            &self.options,
            other.url_scheme(),
            &other.options,
        )
    }
}

impl fmt::Debug for SpiffeServerSecurityConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerSecurityConnector")
            .field("cert_request_type", &self.options.cert_request_type())
            .field("factory_version", &self.factory.version())
            .finish_non_exhaustive()
    }
}
