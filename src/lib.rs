// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! SPIFFE mutual TLS security connectors for gRPC-style channels, backed by
//! [`rustls`] and [`spiffe`].
//!
//! [`SpiffeChannelCredentials`] and [`SpiffeServerCredentials`] hand out
//! security connectors that
//! * keep a TLS handshaker factory current with reloadable key material
//!   ([`CredentialReload`]), rebuilding it only when the material changes;
//! * validate the negotiated ALPN protocol and build an [`AuthContext`] from
//!   the peer certificate;
//! * run an optional, possibly asynchronous, [`AuthorizationCheck`] on the
//!   server identity before the connection is handed out.
//!
//! [`ConnectivityStateTracker`] tracks the lifecycle state of a channel and
//! fans transitions out to watchers without ever calling them inline.
//!
//! With the `workload-api` feature, [`WorkloadApiCredentialReload`] keeps key
//! material in sync with the SPIFFE Workload API.

#![forbid(rust_2018_idioms)]
#![forbid(missing_docs, unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::nursery,
    clippy::dbg_macro,
    clippy::todo
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod auth_context;
mod authz;
mod channel_connector;
mod connectivity;
mod connector;
mod engine;
mod error;
mod factory;
mod handshake;
mod key_materials;
mod options;
pub mod peer;
mod reload;
mod rustls_engine;
mod server_connector;
mod spiffe_authz;
mod trust_domain_store;
#[cfg(feature = "workload-api")]
mod workload_source;

pub use auth_context::{AuthContext, SPIFFE_TRANSPORT_SECURITY_TYPE};
pub use authz::{
    AuthorizationCheck, AuthorizationCheckCall, AuthorizationCheckRequest, CheckSchedule,
    CheckStatus, OnPeerChecked,
};
pub use channel_connector::{SpiffeChannelCredentials, SpiffeChannelSecurityConnector};
pub use connectivity::{
    AsyncWatcher, ConnectivityState, ConnectivityStateTracker, ConnectivityStateWatcher,
    StateReader, WatcherId, WorkSerializer,
};
pub use connector::{SSL_URL_SCHEME, SecurityConnector};
pub use engine::{
    BoxedTransport, ClientCertRequestType, HandshakeFuture, HandshakeOutput, Handshaker,
    HandshakerFactory, SessionCache, TlsEngine, Transport,
};
#[cfg(feature = "workload-api")]
pub use error::WorkloadApiError;
pub use error::{EngineError, Error, Result};
pub use handshake::{HandshakeManager, HandshakePipeline, SecureTransport, SecurityHandshaker};
pub use key_materials::{KeyCertPair, KeyMaterials};
pub use options::{TlsCredentialsOptions, TlsCredentialsOptionsBuilder};
pub use peer::{Peer, PeerProperty};
pub use reload::{CredentialReload, CredentialReloadRequest, ReloadSchedule, ReloadStatus};
pub use rustls_engine::{RustlsEngine, decode_certificates, decode_private_key};
pub use server_connector::{SpiffeServerCredentials, SpiffeServerSecurityConnector};
pub use spiffe_authz::SpiffeIdAuthorizationCheck;
pub use trust_domain_store::TrustDomainStore;
#[cfg(feature = "workload-api")]
pub use workload_source::{
    WorkloadApiCredentialReload, WorkloadApiCredentialReloadBuilder, key_materials_from_context,
};
