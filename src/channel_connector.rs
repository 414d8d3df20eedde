// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{cmp::Ordering, fmt, sync::Arc};

use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::error;

use crate::{
    AuthContext, AuthorizationCheckRequest, Error, HandshakePipeline, OnPeerChecked, Peer, Result,
    SecurityConnector, SecurityHandshaker, SessionCache, TlsCredentialsOptions,
    authz::check_peer_identity,
    connector::{SSL_URL_SCHEME, cmp_credentials, split_host_port},
    factory::{FactorySide, HandshakerFactoryManager},
};

/// Channel credentials backed by [`TlsCredentialsOptions`].
#[derive(Debug, Clone)]
pub struct SpiffeChannelCredentials {
    options: Arc<TlsCredentialsOptions>,
}

impl SpiffeChannelCredentials {
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

    /// Create a connector for `target_name` (`host` or `host:port`).
    ///
    /// `overridden_target_name`, when set, replaces the host for SNI and
    /// server name verification.
    ///
    /// # Errors
    /// [`Error::FailedPrecondition`] for an empty or malformed target name,
    /// otherwise whatever the first handshaker factory build reports.
    pub fn create_security_connector(
        &self,
        target_name: &str,
        overridden_target_name: Option<&str>,
        session_cache: Option<SessionCache>,
    ) -> Result<Arc<SpiffeChannelSecurityConnector>> {
        SpiffeChannelSecurityConnector::create(
            Arc::clone(&self.options),
            target_name,
            overridden_target_name,
            session_cache,
        )
    }
}

/// Client side SPIFFE security connector.
///
/// Owns the client handshaker factory and the authorization check request
/// reused by every connection attempt of the channel.
pub struct SpiffeChannelSecurityConnector {
    options: Arc<TlsCredentialsOptions>,
    target_name: String,
    overridden_target_name: Option<String>,
    factory: HandshakerFactoryManager,
    check_request: Mutex<AuthorizationCheckRequest>,
}

impl SpiffeChannelSecurityConnector {
    fn create(
        options: Arc<TlsCredentialsOptions>,
        target_name: &str,
        overridden_target_name: Option<&str>,
        session_cache: Option<SessionCache>,
    ) -> Result<Arc<Self>> {
        let (host, _port) = split_host_port(target_name)
            .ok_or_else(|| Error::FailedPrecondition(format!("invalid target name {target_name:?}")))?;
        if host.is_empty() {
            #[cfg(feature = "tracing")]
            error!("target_name is empty in SpiffeChannelSecurityConnector::create");
            return Err(Error::FailedPrecondition("target name is required".into()));
        }
        let connector = Self {
            factory: HandshakerFactoryManager::new(
                Arc::clone(&options),
                FactorySide::Client { session_cache },
            ),
            options,
            target_name: host.to_owned(),
            overridden_target_name: overridden_target_name.map(str::to_owned),
            check_request: Mutex::new(AuthorizationCheckRequest::default()),
        };
        if let Err(err) = connector.factory.initialize() {
            #[cfg(feature = "tracing")]
            error!(%err, "could not initialize client handshaker factory");
            return Err(err);
        }
        Ok(Arc::new(connector))
    }

    /// Host part of the configured target.
    #[must_use]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Override used instead of the target for SNI and verification.
    #[must_use]
    pub fn overridden_target_name(&self) -> Option<&str> {
        self.overridden_target_name.as_deref()
    }

    /// The override if set, the target otherwise.
    #[must_use]
    pub fn effective_target_name(&self) -> &str {
        self.overridden_target_name
            .as_deref()
            .unwrap_or(&self.target_name)
    }

    /// Version of the live handshaker factory.
    #[must_use]
    pub fn factory_version(&self) -> Option<u64> {
        self.factory.version()
    }

    /// Whether a call to `host` may use a connection authenticated as
    /// `auth_context`.
    ///
    /// # Errors
    /// [`Error::HostMismatch`] when neither the peer certificate nor the
    /// target name override vouches for `host`.
    pub fn check_call_host(&self, host: &str, auth_context: &AuthContext) -> Result<()> {
        let host_only = split_host_port(host).map_or(host, |(h, _)| h);
        if auth_context.matches_host(host_only) {
            return Ok(());
        }
        // With an override in place the certificate names the override, so
        // the configured target is trusted as well.
        if self.overridden_target_name.is_some() && host_only == self.target_name {
            return Ok(());
        }
        Err(Error::HostMismatch {
            host: host.to_owned(),
        })
    }
}

impl SecurityConnector for SpiffeChannelSecurityConnector {
    fn url_scheme(&self) -> &'static str {
        SSL_URL_SCHEME
    }

    fn add_handshakers(self: Arc<Self>, pipeline: &mut dyn HandshakePipeline) {
        if let Err(_err) = self.factory.refresh() {
            #[cfg(feature = "tracing")]
            error!(err = %_err, "handshaker factory refresh failed");
            return;
        }
        let handshaker = match self
            .factory
            .create_handshaker(Some(self.effective_target_name()))
        {
            Ok(handshaker) => handshaker,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                error!(err = %_err, "handshaker creation failed");
                return;
            }
        };
        pipeline.add(SecurityHandshaker::new(handshaker, self));
    }

    fn check_peer(&self, peer: Peer, on_peer_checked: OnPeerChecked) {
        check_peer_identity(
            peer,
            self.effective_target_name(),
            self.options.authorization_check(),
            &self.check_request,
            on_peer_checked,
        );
    }
}

impl PartialEq for SpiffeChannelSecurityConnector {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SpiffeChannelSecurityConnector {}

impl PartialOrd for SpiffeChannelSecurityConnector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpiffeChannelSecurityConnector {
    /// Connectors compare equal when a pooled connection of one may serve
    /// the other: same credentials, same effective and raw target.
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_credentials(
            self.url_scheme(),
            &self.options,
            other.url_scheme(),
            &other.options,
        )
        .then_with(|| self.effective_target_name().cmp(other.effective_target_name()))
        .then_with(|| self.target_name.cmp(&other.target_name))
    }
}

impl fmt::Debug for SpiffeChannelSecurityConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeChannelSecurityConnector")
            .field("target_name", &self.target_name)
            .field("overridden_target_name", &self.overridden_target_name)
            .field("factory_version", &self.factory.version())
            .finish_non_exhaustive()
    }
}
