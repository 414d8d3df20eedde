// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by security connectors, the handshaker factory manager and
/// the peer authorization check.
///
/// Every failed connection attempt is reported through exactly one of these,
/// delivered to the completion handler of that attempt. Nothing in this crate
/// retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is missing (no target name, no key material source).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An operation the crate deliberately does not support, such as an
    /// asynchronous credential reload.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The handshaker factory could not be built or rebuilt.
    #[error("security error: {0}")]
    Security(String),

    /// The peer did not present a property needed to check it.
    #[error("cannot check peer: missing {property} property")]
    MissingProperty {
        /// Name of the absent peer property.
        property: &'static str,
    },

    /// The negotiated application protocol is not one gRPC accepts.
    #[error("cannot check peer: invalid ALPN value {0:?}")]
    InvalidAlpn(String),

    /// The authorization check ran to completion and rejected the peer.
    #[error("authorization check failed with error: {0}")]
    AuthorizationDenied(String),

    /// The authorization check was cancelled by its owner.
    #[error("authorization check is cancelled by the caller with error: {0}")]
    Cancelled(String),

    /// A completion arrived in a shape that cannot be interpreted.
    #[error("internal error: {0}")]
    Internal(String),

    /// The call host does not match the authenticated peer.
    #[error("call host {host} does not match peer name")]
    HostMismatch {
        /// Host requested by the call.
        host: String,
    },

    /// The TLS engine failed while building or running a handshake.
    #[error("handshake failed: {0}")]
    Handshake(#[from] EngineError),
}

/// Failures raised by a [`TlsEngine`](crate::TlsEngine) implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Certificate or key bytes could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Target name is neither a DNS name nor an IP address.
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    /// rustls rejected the configuration or the handshake.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error(transparent)]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// IO failure on the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the SPIFFE Workload API credential source.
#[cfg(feature = "workload-api")]
#[derive(Debug, Error)]
pub enum WorkloadApiError {
    /// The Workload API client could not connect or stream.
    #[error("workload API client error: {0}")]
    Client(Box<dyn std::error::Error + Send + Sync>),

    /// No configured trust domain has a bundle in the update.
    #[error("no trust bundle for the configured trust domains")]
    MissingRoots,

    /// The update carries no default X509-SVID.
    #[error("no default X509-SVID in the update")]
    MissingSvid,

    /// The stream ended before delivering usable credentials.
    #[error("workload API stream ended")]
    StreamEnded,
}
