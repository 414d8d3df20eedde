// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::pin::Pin;

use parking_lot::Mutex;
use spiffe::{TrustDomain, WorkloadApiClient, X509Context, error::GrpcClientError};
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
#[cfg(feature = "tracing")]
use tracing::{debug, error, warn};

use crate::{
    CredentialReload, CredentialReloadRequest, KeyCertPair, KeyMaterials, ReloadSchedule,
    TrustDomainStore, WorkloadApiError,
};

type X509ContextStream =
    Pin<Box<dyn Stream<Item = Result<X509Context, GrpcClientError>> + Send + Sync + 'static>>;

/// Builder for a [`WorkloadApiCredentialReload`].
///
/// The builder controls which SPIFFE trust bundles end up in the root
/// certificates of the produced [`KeyMaterials`].
pub struct WorkloadApiCredentialReloadBuilder {
    trust_domains: Vec<TrustDomain>,
    client: Option<WorkloadApiClient>,
}

impl WorkloadApiCredentialReloadBuilder {
    const fn new(trust_domains: Vec<TrustDomain>) -> Self {
        Self {
            trust_domains,
            client: None,
        }
    }

    /// Use `client` instead of connecting through `SPIFFE_ENDPOINT_SOCKET`.
    #[must_use]
    pub fn client(mut self, client: WorkloadApiClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Subscribe to X.509 context updates and wait for the first usable one.
    ///
    /// Must be called from within a tokio runtime; the stream is driven by a
    /// spawned task for as long as the returned source is alive.
    ///
    /// # Errors
    /// [`WorkloadApiError::Client`] if the Workload API is unreachable, or
    /// [`WorkloadApiError::StreamEnded`] if the stream closes before the
    /// first usable update.
    pub async fn start(self) -> Result<WorkloadApiCredentialReload, WorkloadApiError> {
        let mut client = match self.client {
            Some(client) => client,
            None => WorkloadApiClient::default()
                .await
                .map_err(|e| WorkloadApiError::Client(e.into()))?,
        };
        let stream: X509ContextStream = Box::pin(
            client
                .stream_x509_contexts()
                .await
                .map_err(|e| WorkloadApiError::Client(e.into()))?,
        );

        let (tx, mut rx) = watch::channel(None);
        tokio::spawn(drive(stream, self.trust_domains, tx));

        rx.wait_for(Option::is_some)
            .await
            .map_err(|_| WorkloadApiError::StreamEnded)?;
        Ok(WorkloadApiCredentialReload::from_updates(rx))
    }
}

/// [`CredentialReload`] fed by the SPIFFE Workload API.
///
/// Every X.509 context update is converted to [`KeyMaterials`]: the default
/// X509-SVID becomes the single key/certificate pair and the bundles of the
/// configured trust domains become the root certificates. A reload reports:
/// * NEW when an update arrived since the previous reload, or the caller
///   has no material yet;
/// * UNCHANGED otherwise;
/// * FAILED once the Workload API stream has ended.
pub struct WorkloadApiCredentialReload {
    updates: Mutex<watch::Receiver<Option<KeyMaterials>>>,
}

impl WorkloadApiCredentialReload {
    /// Create a builder accepting peers from `trust_domains`.
    #[must_use]
    pub const fn builder(trust_domains: Vec<TrustDomain>) -> WorkloadApiCredentialReloadBuilder {
        WorkloadApiCredentialReloadBuilder::new(trust_domains)
    }

    pub(crate) fn from_updates(updates: watch::Receiver<Option<KeyMaterials>>) -> Self {
        Self {
            updates: Mutex::new(updates),
        }
    }
}

impl CredentialReload for WorkloadApiCredentialReload {
    fn schedule(&self, request: &mut CredentialReloadRequest<'_>) -> ReloadSchedule {
        let mut updates = self.updates.lock();
        let Ok(changed) = updates.has_changed() else {
            request.fail(WorkloadApiError::StreamEnded.to_string());
            return ReloadSchedule::Completed;
        };
        if !changed && !request.current().is_empty() {
            request.set_unchanged();
            return ReloadSchedule::Completed;
        }
        let latest = updates.borrow_and_update().clone();
        match latest {
            Some(key_materials) if &key_materials != request.current() => {
                request.set_key_materials(key_materials);
            }
            _ => request.set_unchanged(),
        }
        ReloadSchedule::Completed
    }
}

async fn drive(
    mut stream: X509ContextStream,
    trust_domains: Vec<TrustDomain>,
    tx: watch::Sender<Option<KeyMaterials>>,
) {
    while let Some(update) = stream.next().await {
        if tx.is_closed() {
            break;
        }
        let converted = update
            .map_err(|e| WorkloadApiError::Client(e.into()))
            .and_then(|context| key_materials_from_context(&context, &trust_domains));
        match converted {
            Ok(key_materials) => {
                tx.send_replace(Some(key_materials));
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                warn!(err = %_err, "ignoring workload API update");
            }
        }
    }
    #[cfg(feature = "tracing")]
    error!("workload API stream ended");
}

/// Convert one X.509 context into key material.
///
/// # Errors
/// [`WorkloadApiError::MissingRoots`] or [`WorkloadApiError::MissingSvid`].
pub fn key_materials_from_context(
    context: &X509Context,
    trust_domains: &impl TrustDomainStore,
) -> Result<KeyMaterials, WorkloadApiError> {
    let roots = trust_domains
        .collect_root_certs(context.bundle_set())
        .ok_or(WorkloadApiError::MissingRoots)?;
    let svid = context.default_svid().ok_or(WorkloadApiError::MissingSvid)?;

    #[cfg(feature = "tracing")]
    debug!(workload_identity = %svid.spiffe_id());

    let cert_chain: Vec<u8> = svid
        .cert_chain()
        .iter()
        .flat_map(|cert| cert.content().iter().copied())
        .collect();
    let private_key = svid.private_key().content().to_owned();
    Ok(KeyMaterials::new(
        Some(roots),
        vec![KeyCertPair::new(cert_chain, private_key)],
    ))
}
