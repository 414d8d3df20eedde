// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{cmp::Ordering, fmt, sync::Arc};

use crate::{HandshakePipeline, OnPeerChecked, Peer, TlsCredentialsOptions};

/// URL scheme shared by every TLS connector.
pub const SSL_URL_SCHEME: &str = "https";

/// Security policy of one channel or listener.
pub trait SecurityConnector: Send + Sync + fmt::Debug {
    /// Scheme the connector secures.
    fn url_scheme(&self) -> &'static str;

    /// Contribute a handshaker for a new connection attempt.
    ///
    /// There is no result channel: failures are logged and no handshaker
    /// is added, which the pipeline reports as a failed attempt.
    fn add_handshakers(self: Arc<Self>, pipeline: &mut dyn HandshakePipeline);

    /// Check the peer of a finished handshake. `on_peer_checked` runs
    /// exactly once, possibly on another thread.
    fn check_peer(&self, peer: Peer, on_peer_checked: OnPeerChecked);
}

/// Ordering shared by all connectors: scheme, then credentials identity.
pub(crate) fn cmp_credentials(
    scheme: &str,
    options: &Arc<TlsCredentialsOptions>,
    other_scheme: &str,
    other_options: &Arc<TlsCredentialsOptions>,
) -> Ordering {
    scheme.cmp(other_scheme).then_with(|| {
        Arc::as_ptr(options)
            .cast::<()>()
            .cmp(&Arc::as_ptr(other_options).cast::<()>())
    })
}

/// Split `host:port`, `[v6]:port`, `[v6]`, bare `host` or a bare IPv6
/// literal into host and optional port.
pub(crate) fn split_host_port(name: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = name.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after {
            "" => Some((host, None)),
            _ => after.strip_prefix(':').map(|port| (host, Some(port))),
        };
    }
    match name.split_once(':') {
        None => Some((name, None)),
        // More than one colon: an unbracketed IPv6 literal without a port.
        Some((_, rest)) if rest.contains(':') => Some((name, None)),
        Some((host, port)) => Some((host, Some(port))),
    }
}
