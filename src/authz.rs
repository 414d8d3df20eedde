// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Peer authorization: ALPN validation, identity extraction and the optional
//! external [`AuthorizationCheck`].

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::{debug, error};

use crate::{
    AuthContext, Error, Peer, Result,
    peer::{PEER_CERT_PROPERTY, check_alpn},
};

/// Completion handler of a connection attempt. Called exactly once.
pub type OnPeerChecked = Box<dyn FnOnce(Result<AuthContext>) + Send + 'static>;

/// Status an [`AuthorizationCheck`] reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    /// The check ran; see the success flag for its verdict.
    #[default]
    Ok,
    /// The owner of the check cancelled it.
    Cancelled,
    /// The check failed for an unknown reason.
    Unknown,
    /// The check did not finish in time.
    DeadlineExceeded,
    /// The backing service could not be reached.
    Unavailable,
    /// The check broke internally.
    Internal,
}

/// What the external check is asked to authorize.
///
/// One request lives for the whole lifetime of a channel connector and is
/// reused by every attempt: each field is filled only while still empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationCheckRequest {
    peer_cert: Option<Vec<u8>>,
    target_name: Option<String>,
}

impl AuthorizationCheckRequest {
    /// DER leaf certificate presented by the peer.
    #[must_use]
    pub fn peer_cert(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    /// Name the connector dialed (after any override).
    #[must_use]
    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    fn populate(&mut self, peer_cert: &[u8], target_name: &str) {
        if self.peer_cert.is_none() {
            self.peer_cert = Some(peer_cert.to_vec());
        }
        if self.target_name.is_none() {
            self.target_name = Some(target_name.to_owned());
        }
    }
}

/// An in-flight authorization check.
///
/// Handed to [`AuthorizationCheck::schedule`]. A synchronous check records
/// its verdict and hands the call back through [`CheckSchedule::Completed`];
/// an asynchronous one keeps the call and invokes [`complete`] later. Either
/// way the connection attempt's completion handler runs exactly once. A call
/// dropped without completing reports [`Error::Internal`].
///
/// [`complete`]: Self::complete
pub struct AuthorizationCheckCall {
    request: AuthorizationCheckRequest,
    status: CheckStatus,
    success: bool,
    error_details: Option<String>,
    auth_context: Option<AuthContext>,
    on_peer_checked: Option<OnPeerChecked>,
}

impl AuthorizationCheckCall {
    fn new(
        request: AuthorizationCheckRequest,
        auth_context: AuthContext,
        on_peer_checked: OnPeerChecked,
    ) -> Self {
        Self {
            request,
            status: CheckStatus::Ok,
            success: false,
            error_details: None,
            auth_context: Some(auth_context),
            on_peer_checked: Some(on_peer_checked),
        }
    }

    /// What to authorize.
    ///
    /// The request is shared by every attempt of the connector, so it
    /// describes the first peer seen. Use [`auth_context`](Self::auth_context)
    /// for the peer of this attempt.
    #[must_use]
    pub const fn request(&self) -> &AuthorizationCheckRequest {
        &self.request
    }

    /// Authentication context of the peer of this attempt.
    #[must_use]
    pub const fn auth_context(&self) -> Option<&AuthContext> {
        self.auth_context.as_ref()
    }

    /// Record the outcome of the check.
    pub fn set_result(
        &mut self,
        status: CheckStatus,
        success: bool,
        error_details: Option<String>,
    ) {
        self.status = status;
        self.success = success;
        self.error_details = error_details;
    }

    /// Shorthand for a successful check.
    pub fn approve(&mut self) {
        self.set_result(CheckStatus::Ok, true, None);
    }

    /// Shorthand for a completed check that rejects the peer.
    pub fn deny(&mut self, details: impl Into<String>) {
        self.set_result(CheckStatus::Ok, false, Some(details.into()));
    }

    /// Deliver the recorded outcome to the connection attempt.
    pub fn complete(mut self) {
        self.finish();
    }

    fn result(&self) -> Result<()> {
        let details = self.error_details.as_deref().unwrap_or_default();
        match (self.status, self.success) {
            (CheckStatus::Ok, true) => Ok(()),
            (CheckStatus::Ok, false) => Err(Error::AuthorizationDenied(details.to_owned())),
            (CheckStatus::Cancelled, _) => Err(Error::Cancelled(details.to_owned())),
            (_, _) => Err(Error::Internal(format!(
                "authorization check did not finish correctly with error: {details}"
            ))),
        }
    }

    fn finish(&mut self) {
        let Some(on_peer_checked) = self.on_peer_checked.take() else {
            return;
        };
        let result = self.result().and_then(|()| {
            self.auth_context
                .take()
                .ok_or_else(|| Error::Internal("authentication context already consumed".into()))
        });

        #[cfg(feature = "tracing")]
        if let Err(err) = &result {
            debug!(%err, "peer authorization check rejected the peer");
        }

        self.error_details = None;
        on_peer_checked(result);
    }
}

impl Drop for AuthorizationCheckCall {
    fn drop(&mut self) {
        if self.on_peer_checked.is_some() {
            #[cfg(feature = "tracing")]
            error!("authorization check dropped before completion");
            self.set_result(
                CheckStatus::Internal,
                false,
                Some("authorization check dropped before completion".into()),
            );
            self.finish();
        }
    }
}

impl fmt::Debug for AuthorizationCheckCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCheckCall")
            .field("request", &self.request)
            .field("status", &self.status)
            .field("success", &self.success)
            .field("completed", &self.on_peer_checked.is_none())
            .finish_non_exhaustive()
    }
}

/// How an [`AuthorizationCheck`] handled a call.
#[derive(Debug)]
pub enum CheckSchedule {
    /// The verdict is recorded on the returned call.
    Completed(AuthorizationCheckCall),
    /// The check kept the call and will [`complete`] it later.
    ///
    /// [`complete`]: AuthorizationCheckCall::complete
    Pending,
}

/// External authorization of the server identity, run by channel
/// connectors after the handshake.
pub trait AuthorizationCheck: Send + Sync {
    /// Start checking `call`. No timeout is enforced on pending calls;
    /// cancellation belongs to the implementation.
    fn schedule(&self, call: AuthorizationCheckCall) -> CheckSchedule;
}

/// Run the full peer check for one connection attempt. `peer` is consumed
/// and dropped before any asynchronous hand-off.
pub(crate) fn check_peer_identity(
    peer: Peer,
    target_name: &str,
    authorization_check: Option<&Arc<dyn AuthorizationCheck>>,
    shared_request: &Mutex<AuthorizationCheckRequest>,
    on_peer_checked: OnPeerChecked,
) {
    if let Err(err) = check_alpn(&peer) {
        on_peer_checked(Err(err));
        return;
    }
    let auth_context = AuthContext::from_peer(&peer);
    let Some(authorization_check) = authorization_check else {
        on_peer_checked(Ok(auth_context));
        return;
    };
    let Some(peer_cert) = peer.property(PEER_CERT_PROPERTY) else {
        on_peer_checked(Err(Error::MissingProperty {
            property: PEER_CERT_PROPERTY,
        }));
        return;
    };
    let request = {
        let mut shared = shared_request.lock();
        shared.populate(peer_cert.value(), target_name);
        shared.clone()
    };
    drop(peer);

    let call = AuthorizationCheckCall::new(request, auth_context, on_peer_checked);
    match authorization_check.schedule(call) {
        CheckSchedule::Completed(call) => call.complete(),
        CheckSchedule::Pending => {
            #[cfg(feature = "tracing")]
            debug!(target_name, "authorization check scheduled asynchronously");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::peer::ALPN_SELECTED_PROTOCOL_PROPERTY;

    fn recorder() -> (Arc<Mutex<Vec<Result<AuthContext>>>>, OnPeerChecked) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (
            results,
            Box::new(move |result| sink.lock().push(result)),
        )
    }

    fn call() -> (Arc<Mutex<Vec<Result<AuthContext>>>>, AuthorizationCheckCall) {
        let (results, on_peer_checked) = recorder();
        let call = AuthorizationCheckCall::new(
            AuthorizationCheckRequest::default(),
            AuthContext::from_peer(&Peer::new()),
            on_peer_checked,
        );
        (results, call)
    }

    #[test]
    fn status_mapping() {
        let cases: [(CheckStatus, bool, fn(&Error) -> bool); 4] = [
            (CheckStatus::Ok, false, |e| matches!(e, Error::AuthorizationDenied(d) if d == "why")),
            (CheckStatus::Cancelled, true, |e| matches!(e, Error::Cancelled(d) if d == "why")),
            (CheckStatus::Unavailable, true, |e| matches!(e, Error::Internal(d) if d.contains("why"))),
            (CheckStatus::Unknown, false, |e| matches!(e, Error::Internal(_))),
        ];
        for (status, success, expected) in cases {
            let (results, mut call) = call();
            call.set_result(status, success, Some("why".into()));
            call.complete();
            let results = results.lock();
            assert_eq!(results.len(), 1);
            let err = results[0].as_ref().unwrap_err();
            assert!(expected(err), "{status:?}/{success}: {err}");
        }
    }

    #[test]
    fn approved_call_yields_auth_context() {
        let (results, mut call) = call();
        call.approve();
        call.complete();
        assert!(matches!(results.lock().as_slice(), [Ok(_)]));
    }

    #[test]
    fn dropped_call_reports_internal_error_once() {
        let (results, call) = call();
        drop(call);
        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::Internal(_))));
    }

    #[test]
    fn request_fields_are_filled_once() {
        let mut request = AuthorizationCheckRequest::default();
        request.populate(b"first", "a.example.org");
        request.populate(b"second", "b.example.org");
        assert_eq!(request.peer_cert(), Some(&b"first"[..]));
        assert_eq!(request.target_name(), Some("a.example.org"));
    }

    struct Never(AtomicUsize);

    impl AuthorizationCheck for Never {
        fn schedule(&self, call: AuthorizationCheckCall) -> CheckSchedule {
            self.0.fetch_add(1, Ordering::SeqCst);
            CheckSchedule::Completed(call)
        }
    }

    #[test]
    fn alpn_failure_bypasses_authorization() {
        let check: Arc<dyn AuthorizationCheck> = Arc::new(Never(AtomicUsize::new(0)));
        let shared = Mutex::new(AuthorizationCheckRequest::default());
        let (results, on_peer_checked) = recorder();
        let peer = Peer::new().with_property(PEER_CERT_PROPERTY, b"cert".to_vec());

        check_peer_identity(peer, "svc", Some(&check), &shared, on_peer_checked);

        assert!(matches!(
            results.lock().as_slice(),
            [Err(Error::MissingProperty { property: ALPN_SELECTED_PROTOCOL_PROPERTY })]
        ));
        assert_eq!(*shared.lock(), AuthorizationCheckRequest::default());
    }
}
