// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use rustls_spiffe_connector::{
    AuthContext, AuthorizationCheck, AuthorizationCheckCall, AuthorizationCheckRequest,
    BoxedTransport, CheckSchedule, ClientCertRequestType, CredentialReload,
    CredentialReloadRequest, EngineError, Error, HandshakeFuture, HandshakeManager,
    HandshakeOutput, Handshaker, HandshakerFactory, KeyCertPair, KeyMaterials, Peer,
    ReloadSchedule, SecurityConnector, SessionCache, SpiffeChannelCredentials,
    SpiffeChannelSecurityConnector, SpiffeServerCredentials, TlsCredentialsOptions,
    TlsCredentialsOptionsBuilder, TlsEngine,
    peer::{
        ALPN_SELECTED_PROTOCOL_PROPERTY, PEER_CERT_PROPERTY, SPIFFE_ID_PROPERTY,
        SUBJECT_ALTERNATIVE_NAME_PROPERTY,
    },
};
use tokio::{io::duplex, sync::mpsc};

/// Engine whose handshakers succeed immediately and report a fixed peer.
#[derive(Debug)]
struct FakeEngine {
    peer: Peer,
    builds: AtomicUsize,
    targets: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeEngine {
    fn new(peer: Peer) -> Arc<Self> {
        Arc::new(Self {
            peer,
            builds: AtomicUsize::new(0),
            targets: Arc::default(),
        })
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn factory(&self) -> Arc<dyn HandshakerFactory> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeFactory {
            peer: self.peer.clone(),
            targets: Arc::clone(&self.targets),
        })
    }
}

impl TlsEngine for FakeEngine {
    fn build_client(
        &self,
        _pairs: &[KeyCertPair],
        _root_certs: Option<&[u8]>,
        _session_cache: Option<&SessionCache>,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError> {
        Ok(self.factory())
    }

    fn build_server(
        &self,
        _pairs: &[KeyCertPair],
        _root_certs: Option<&[u8]>,
        _cert_request: ClientCertRequestType,
    ) -> Result<Arc<dyn HandshakerFactory>, EngineError> {
        Ok(self.factory())
    }
}

#[derive(Debug)]
struct FakeFactory {
    peer: Peer,
    targets: Arc<Mutex<Vec<Option<String>>>>,
}

impl HandshakerFactory for FakeFactory {
    fn create_handshaker(
        &self,
        target_name: Option<&str>,
    ) -> Result<Box<dyn Handshaker>, EngineError> {
        self.targets.lock().push(target_name.map(str::to_owned));
        Ok(Box::new(FakeHandshaker {
            peer: self.peer.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeHandshaker {
    peer: Peer,
}

impl Handshaker for FakeHandshaker {
    fn handshake(self: Box<Self>, transport: BoxedTransport) -> HandshakeFuture {
        let peer = self.peer;
        Box::pin(async move { Ok(HandshakeOutput { transport, peer }) })
    }
}

enum Step {
    New(KeyMaterials),
    Unchanged,
    Fail(&'static str),
    Pending,
}

/// Reload source answering each request with the next scripted step.
struct Scripted(Mutex<VecDeque<Step>>);

impl Scripted {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(steps.into_iter().collect())))
    }
}

impl CredentialReload for Scripted {
    fn schedule(&self, request: &mut CredentialReloadRequest<'_>) -> ReloadSchedule {
        match self.0.lock().pop_front().unwrap_or(Step::Unchanged) {
            Step::New(key_materials) => request.set_key_materials(key_materials),
            Step::Unchanged => request.set_unchanged(),
            Step::Fail(details) => request.fail(details),
            Step::Pending => return ReloadSchedule::Pending,
        }
        ReloadSchedule::Completed
    }
}

/// Synchronous check with a fixed verdict that records every request.
struct Verdict {
    approve: bool,
    seen: Mutex<Vec<AuthorizationCheckRequest>>,
    identities: Mutex<Vec<Option<String>>>,
}

impl Verdict {
    fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            seen: Mutex::default(),
            identities: Mutex::default(),
        })
    }
}

impl AuthorizationCheck for Verdict {
    fn schedule(&self, mut call: AuthorizationCheckCall) -> CheckSchedule {
        self.seen.lock().push(call.request().clone());
        self.identities.lock().push(
            call.auth_context()
                .and_then(AuthContext::spiffe_id)
                .map(|id| id.to_string()),
        );
        if self.approve {
            call.approve();
        } else {
            call.deny("server identity not allowed");
        }
        CheckSchedule::Completed(call)
    }
}

/// Check that hands every call to the test to complete later.
struct Deferred(mpsc::UnboundedSender<AuthorizationCheckCall>);

impl AuthorizationCheck for Deferred {
    fn schedule(&self, call: AuthorizationCheckCall) -> CheckSchedule {
        let _ = self.0.send(call);
        CheckSchedule::Pending
    }
}

fn materials(tag: &str) -> KeyMaterials {
    KeyMaterials::new(
        Some(format!("roots-{tag}").into_bytes()),
        vec![KeyCertPair::new(
            format!("cert-{tag}").into_bytes(),
            format!("key-{tag}").into_bytes(),
        )],
    )
}

fn server_peer() -> Peer {
    Peer::new()
        .with_property(PEER_CERT_PROPERTY, b"leaf-der".to_vec())
        .with_property(SUBJECT_ALTERNATIVE_NAME_PROPERTY, "foo.test")
        .with_property(SUBJECT_ALTERNATIVE_NAME_PROPERTY, "spiffe://example.org/foo")
        .with_property(SPIFFE_ID_PROPERTY, "spiffe://example.org/foo")
        .with_property(ALPN_SELECTED_PROTOCOL_PROPERTY, "h2")
}

fn options(engine: &Arc<FakeEngine>) -> TlsCredentialsOptionsBuilder {
    TlsCredentialsOptions::builder().engine(Arc::clone(engine) as Arc<dyn TlsEngine>)
}

fn channel(
    options: TlsCredentialsOptions,
    target: &str,
) -> Result<Arc<SpiffeChannelSecurityConnector>, Error> {
    SpiffeChannelCredentials::new(options).create_security_connector(target, None, None)
}

fn transport() -> BoxedTransport {
    let (client, _server) = duplex(64);
    Box::new(client)
}

async fn connect<C: SecurityConnector + 'static>(connector: &Arc<C>) -> Result<AuthContext, Error> {
    let mut pipeline = HandshakeManager::new();
    Arc::clone(connector).add_handshakers(&mut pipeline);
    pipeline
        .do_handshake(transport())
        .await
        .map(|secured| secured.auth_context)
}

#[test]
fn static_material_is_built_once() {
    let engine = FakeEngine::new(server_peer());
    let connector = channel(options(&engine).key_materials(materials("a")).build(), "foo.test:443")
        .unwrap();

    assert_eq!(connector.target_name(), "foo.test");
    assert_eq!(connector.factory_version(), Some(1));

    let mut pipeline = HandshakeManager::new();
    Arc::clone(&connector).add_handshakers(&mut pipeline);
    Arc::clone(&connector).add_handshakers(&mut pipeline);

    assert_eq!(pipeline.len(), 2);
    assert_eq!(engine.builds(), 1);
    assert_eq!(connector.factory_version(), Some(1));
}

#[test]
fn only_new_material_rebuilds_factory() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([
        Step::New(materials("a")),
        Step::Unchanged,
        Step::New(materials("b")),
    ]);
    let connector = channel(options(&engine).credential_reload(reload).build(), "foo.test").unwrap();
    assert_eq!(connector.factory_version(), Some(1));

    let mut pipeline = HandshakeManager::new();
    Arc::clone(&connector).add_handshakers(&mut pipeline);
    assert_eq!(connector.factory_version(), Some(1));

    Arc::clone(&connector).add_handshakers(&mut pipeline);
    assert_eq!(connector.factory_version(), Some(2));
    assert_eq!(engine.builds(), 2);
    assert_eq!(pipeline.len(), 2);
}

#[test]
fn failed_reload_keeps_existing_factory() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([Step::Unchanged, Step::Fail("agent unavailable")]);
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .credential_reload(reload)
            .build(),
        "foo.test",
    )
    .unwrap();

    let mut pipeline = HandshakeManager::new();
    Arc::clone(&connector).add_handshakers(&mut pipeline);

    assert_eq!(pipeline.len(), 1);
    assert_eq!(engine.builds(), 1);
}

#[test]
fn failed_reload_without_material_fails_creation() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([Step::Fail("agent unavailable")]);
    let err = channel(options(&engine).credential_reload(reload).build(), "foo.test").unwrap_err();
    assert!(matches!(err, Error::Internal(d) if d.contains("agent unavailable")));
}

#[test]
fn no_material_source_fails_creation() {
    let engine = FakeEngine::new(server_peer());
    let err = channel(options(&engine).build(), "foo.test").unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));
    assert_eq!(engine.builds(), 0);
}

#[test]
fn async_reload_is_unimplemented_without_material() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([Step::Pending]);
    let err = channel(options(&engine).credential_reload(reload).build(), "foo.test").unwrap_err();
    assert!(matches!(err, Error::Unimplemented(_)));
}

#[test]
fn async_reload_with_material_reuses_factory() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([Step::Unchanged, Step::Pending]);
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .credential_reload(reload)
            .build(),
        "foo.test",
    )
    .unwrap();

    let mut pipeline = HandshakeManager::new();
    Arc::clone(&connector).add_handshakers(&mut pipeline);
    assert_eq!(pipeline.len(), 1);
    assert_eq!(engine.builds(), 1);
}

#[tokio::test]
async fn failed_rebuild_drops_attempt_but_keeps_factory() {
    let engine = FakeEngine::new(server_peer());
    let reload = Scripted::new([Step::New(materials("a")), Step::New(KeyMaterials::default())]);
    let connector = channel(options(&engine).credential_reload(reload).build(), "foo.test").unwrap();

    let mut pipeline = HandshakeManager::new();
    Arc::clone(&connector).add_handshakers(&mut pipeline);

    assert!(pipeline.is_empty());
    assert_eq!(connector.factory_version(), Some(1));
    let err = pipeline.do_handshake(transport()).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));
}

#[test]
fn empty_target_is_rejected() {
    for target in ["", ":443"] {
        let engine = FakeEngine::new(server_peer());
        let err = channel(options(&engine).key_materials(materials("a")).build(), target)
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)), "{target:?}");
    }
}

#[tokio::test]
async fn accepts_peer_without_authorization_check() {
    let engine = FakeEngine::new(server_peer());
    let connector = channel(options(&engine).key_materials(materials("a")).build(), "foo.test")
        .unwrap();

    let auth_context = connect(&connector).await.unwrap();

    assert_eq!(auth_context.transport_security_type(), "spiffe");
    assert_eq!(
        auth_context.spiffe_id(),
        Some("spiffe://example.org/foo".try_into().unwrap())
    );
    assert_eq!(
        auth_context.peer_identity().collect::<Vec<_>>(),
        ["foo.test", "spiffe://example.org/foo"]
    );
}

#[tokio::test]
async fn overridden_target_is_used_for_handshakes() {
    let engine = FakeEngine::new(server_peer());
    let connector = SpiffeChannelCredentials::new(
        options(&engine).key_materials(materials("a")).build(),
    )
    .create_security_connector("10.0.0.1:443", Some("foo.test"), None)
    .unwrap();

    connect(&connector).await.unwrap();

    assert_eq!(connector.effective_target_name(), "foo.test");
    assert_eq!(*engine.targets.lock(), [Some("foo.test".to_owned())]);
}

#[tokio::test]
async fn denied_authorization_fails_attempt() {
    let engine = FakeEngine::new(server_peer());
    let check = Verdict::new(false);
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .authorization_check(Arc::clone(&check) as Arc<dyn AuthorizationCheck>)
            .build(),
        "foo.test",
    )
    .unwrap();

    let err = connect(&connector).await.unwrap_err();

    assert!(matches!(err, Error::AuthorizationDenied(d) if d == "server identity not allowed"));
    let seen = check.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].peer_cert(), Some(&b"leaf-der"[..]));
    assert_eq!(seen[0].target_name(), Some("foo.test"));
}

#[tokio::test]
async fn check_request_is_filled_by_first_attempt_only() {
    let engine = FakeEngine::new(server_peer());
    let check = Verdict::new(true);
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .authorization_check(Arc::clone(&check) as Arc<dyn AuthorizationCheck>)
            .build(),
        "foo.test",
    )
    .unwrap();

    connect(&connector).await.unwrap();
    let other_peer = Peer::new()
        .with_property(PEER_CERT_PROPERTY, b"other-leaf".to_vec())
        .with_property(SPIFFE_ID_PROPERTY, "spiffe://example.org/other")
        .with_property(ALPN_SELECTED_PROTOCOL_PROPERTY, "h2");
    let (tx, rx) = tokio::sync::oneshot::channel();
    connector.check_peer(
        other_peer,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.await.unwrap().unwrap();

    let seen = check.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].peer_cert(), Some(&b"leaf-der"[..]));
    // The call itself always carries the identity of the current peer.
    assert_eq!(
        *check.identities.lock(),
        [
            Some("spiffe://example.org/foo".to_owned()),
            Some("spiffe://example.org/other".to_owned())
        ]
    );
}

#[tokio::test]
async fn pending_authorization_completes_later() {
    let engine = FakeEngine::new(server_peer());
    let (tx, mut calls) = mpsc::unbounded_channel();
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .authorization_check(Arc::new(Deferred(tx)))
            .build(),
        "foo.test",
    )
    .unwrap();

    let attempt = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move { connect(&connector).await }
    });

    let mut call = calls.recv().await.unwrap();
    assert_eq!(call.request().target_name(), Some("foo.test"));
    call.approve();
    call.complete();

    let auth_context = attempt.await.unwrap().unwrap();
    assert!(auth_context.spiffe_id().is_some());
}

#[tokio::test]
async fn abandoned_authorization_fails_attempt() {
    let engine = FakeEngine::new(server_peer());
    let (tx, mut calls) = mpsc::unbounded_channel();
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .authorization_check(Arc::new(Deferred(tx)))
            .build(),
        "foo.test",
    )
    .unwrap();

    let attempt = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move { connect(&connector).await }
    });
    drop(calls.recv().await.unwrap());

    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[tokio::test]
async fn authorization_needs_peer_certificate() {
    let peer = Peer::new().with_property(ALPN_SELECTED_PROTOCOL_PROPERTY, "h2");
    let engine = FakeEngine::new(peer);
    let check = Verdict::new(true);
    let connector = channel(
        options(&engine)
            .key_materials(materials("a"))
            .authorization_check(Arc::clone(&check) as Arc<dyn AuthorizationCheck>)
            .build(),
        "foo.test",
    )
    .unwrap();

    let err = connect(&connector).await.unwrap_err();

    assert!(matches!(err, Error::MissingProperty { property } if property == PEER_CERT_PROPERTY));
    assert!(check.seen.lock().is_empty());
}

#[tokio::test]
async fn unexpected_alpn_is_rejected() {
    let peer = Peer::new()
        .with_property(PEER_CERT_PROPERTY, b"leaf-der".to_vec())
        .with_property(ALPN_SELECTED_PROTOCOL_PROPERTY, "http/1.1");
    let engine = FakeEngine::new(peer);
    let connector = channel(options(&engine).key_materials(materials("a")).build(), "foo.test")
        .unwrap();

    let err = connect(&connector).await.unwrap_err();
    assert!(matches!(err, Error::InvalidAlpn(p) if p == "http/1.1"));
}

#[test]
fn call_host_must_match_peer_or_target() {
    let engine = FakeEngine::new(server_peer());
    let auth_context = AuthContext::from_peer(&server_peer());

    let plain = channel(options(&engine).key_materials(materials("a")).build(), "foo.test")
        .unwrap();
    assert!(plain.check_call_host("foo.test:443", &auth_context).is_ok());
    assert!(matches!(
        plain.check_call_host("bar.test", &auth_context),
        Err(Error::HostMismatch { host }) if host == "bar.test"
    ));

    let overridden = SpiffeChannelCredentials::new(
        options(&engine).key_materials(materials("a")).build(),
    )
    .create_security_connector("bar.test", Some("foo.test"), None)
    .unwrap();
    assert!(overridden.check_call_host("bar.test", &auth_context).is_ok());
    assert!(overridden.check_call_host("baz.test", &auth_context).is_err());
}

#[test]
fn connectors_compare_by_credentials_and_target() {
    let engine = FakeEngine::new(server_peer());
    let credentials =
        SpiffeChannelCredentials::new(options(&engine).key_materials(materials("a")).build());
    let create = |target: &str, overridden: Option<&str>| {
        credentials
            .create_security_connector(target, overridden, None)
            .unwrap()
    };

    assert_eq!(create("foo.test", None), create("foo.test:443", None));
    assert_ne!(create("foo.test", None), create("bar.test", None));
    assert_ne!(
        create("foo.test", Some("a.test")),
        create("foo.test", Some("b.test"))
    );
    assert_ne!(create("foo.test", Some("x.test")), create("bar.test", Some("x.test")));

    let other =
        SpiffeChannelCredentials::new(options(&engine).key_materials(materials("a")).build());
    assert_ne!(
        create("foo.test", None),
        other.create_security_connector("foo.test", None, None).unwrap()
    );
}

#[tokio::test]
async fn server_connector_checks_alpn_only() {
    let engine = FakeEngine::new(server_peer());
    let credentials = SpiffeServerCredentials::new(
        options(&engine)
            .key_materials(materials("a"))
            .cert_request_type(ClientCertRequestType::RequestButDontVerify)
            .build(),
    );
    let first = credentials.create_security_connector().unwrap();
    let second = credentials.create_security_connector().unwrap();
    assert_eq!(first, second);

    let auth_context = connect(&first).await.unwrap();
    assert_eq!(auth_context.transport_security_type(), "spiffe");
    assert_eq!(*engine.targets.lock(), [None]);

    let (tx, rx) = tokio::sync::oneshot::channel();
    first.check_peer(
        Peer::new(),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(matches!(rx.await.unwrap(), Err(Error::MissingProperty { .. })));
}
