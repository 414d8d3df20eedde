// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use spiffe::{SpiffeId, TrustDomain};
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::{
    AuthContext, AuthorizationCheck, AuthorizationCheckCall, CheckSchedule, TrustDomainStore,
};

/// Synchronous [`AuthorizationCheck`] that accepts a server whose leaf
/// certificate carries a SPIFFE id from one of the configured trust domains.
///
/// With [`allow_ids`](Self::allow_ids) the id must additionally be one of
/// the listed ids.
#[derive(Debug, Clone)]
pub struct SpiffeIdAuthorizationCheck {
    trust_domains: Vec<TrustDomain>,
    allowed_ids: Option<Vec<SpiffeId>>,
}

impl SpiffeIdAuthorizationCheck {
    /// Accept any SPIFFE id in `trust_domains`.
    #[must_use]
    pub const fn new(trust_domains: Vec<TrustDomain>) -> Self {
        Self {
            trust_domains,
            allowed_ids: None,
        }
    }

    /// Restrict acceptance to exactly these ids.
    #[must_use]
    pub fn allow_ids(mut self, ids: impl IntoIterator<Item = SpiffeId>) -> Self {
        self.allowed_ids = Some(ids.into_iter().collect());
        self
    }

    fn verdict(&self, peer: Option<&AuthContext>) -> Result<SpiffeId, String> {
        let id = peer
            .and_then(AuthContext::spiffe_id)
            .ok_or_else(|| "peer certificate carries no SPIFFE id".to_owned())?;
        if !self.is_trusted(&id) {
            return Err(format!("{id} is not in an accepted trust domain"));
        }
        if let Some(allowed) = &self.allowed_ids
            && !allowed.contains(&id)
        {
            return Err(format!("{id} is not an allowed SPIFFE id"));
        }
        Ok(id)
    }
}

impl TrustDomainStore for SpiffeIdAuthorizationCheck {
    fn trust_domains(&self) -> &[TrustDomain] {
        &self.trust_domains
    }
}

impl AuthorizationCheck for SpiffeIdAuthorizationCheck {
    fn schedule(&self, mut call: AuthorizationCheckCall) -> CheckSchedule {
        match self.verdict(call.auth_context()) {
            Ok(_id) => {
                #[cfg(feature = "tracing")]
                debug!(peer_identity = %_id, "authorized peer");
                call.approve();
            }
            Err(details) => call.deny(details),
        }
        CheckSchedule::Completed(call)
    }
}
