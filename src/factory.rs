// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::sync::Arc;

use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::debug;

use crate::{
    ClientCertRequestType, Error, Handshaker, HandshakerFactory, KeyMaterials, Result,
    SessionCache, TlsCredentialsOptions,
    reload::{ReloadStatus, fetch_key_materials},
};

/// Which kind of factory a manager builds.
pub(crate) enum FactorySide {
    Client { session_cache: Option<SessionCache> },
    Server { cert_request: ClientCertRequestType },
}

struct LiveFactory {
    version: u64,
    factory: Arc<dyn HandshakerFactory>,
}

struct State {
    key_materials: KeyMaterials,
    live: Option<LiveFactory>,
    builds: u64,
}

/// Owns the live handshaker factory of one connector.
///
/// Reading options, reloading, rebuilding and installing all happen under one
/// lock, and handshakers are created under that same lock, so nobody ever
/// sees a factory mid-replacement. The previous factory is dropped only once
/// its successor is installed.
pub(crate) struct HandshakerFactoryManager {
    options: Arc<TlsCredentialsOptions>,
    side: FactorySide,
    state: Mutex<State>,
}

impl HandshakerFactoryManager {
    pub(crate) fn new(options: Arc<TlsCredentialsOptions>, side: FactorySide) -> Self {
        Self {
            options,
            side,
            state: Mutex::new(State {
                key_materials: KeyMaterials::default(),
                live: None,
                builds: 0,
            }),
        }
    }

    /// First build: seed the store from the options, reload, then build
    /// unconditionally.
    pub(crate) fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(key_materials) = self.options.key_materials() {
            state.key_materials = key_materials.clone();
        }
        fetch_key_materials(&mut state.key_materials, self.options.credential_reload())?;
        self.replace_factory(&mut state)
    }

    /// Reload and rebuild only when the reload produced new material.
    pub(crate) fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock();
        let status =
            fetch_key_materials(&mut state.key_materials, self.options.credential_reload())?;
        if status != ReloadStatus::New && state.live.is_some() {
            #[cfg(feature = "tracing")]
            debug!(?status, "re-using existing handshaker factory");
            return Ok(());
        }
        self.replace_factory(&mut state)
    }

    pub(crate) fn create_handshaker(&self, target_name: Option<&str>) -> Result<Box<dyn Handshaker>> {
        let state = self.state.lock();
        let live = state
            .live
            .as_ref()
            .ok_or_else(|| Error::Security("handshaker factory is not initialized".into()))?;
        Ok(live.factory.create_handshaker(target_name)?)
    }

    /// Version of the live factory; bumps on every successful rebuild.
    pub(crate) fn version(&self) -> Option<u64> {
        self.state.lock().live.as_ref().map(|live| live.version)
    }

    fn replace_factory(&self, state: &mut State) -> Result<()> {
        if state.key_materials.is_empty() {
            return Err(Error::Security(
                "no certificate/key pair to build a handshaker factory from".into(),
            ));
        }
        let pairs = state.key_materials.pairs();
        let root_certs = state.key_materials.root_certs();
        let engine = self.options.engine();
        let factory = match &self.side {
            FactorySide::Client { session_cache } => {
                engine.build_client(pairs, root_certs, session_cache.as_ref())
            }
            FactorySide::Server { cert_request } => {
                engine.build_server(pairs, root_certs, *cert_request)
            }
        }
        .map_err(|e| Error::Security(format!("failed to build handshaker factory: {e}")))?;

        state.builds += 1;
        let version = state.builds;
        let previous = state.live.replace(LiveFactory { version, factory });

        #[cfg(feature = "tracing")]
        debug!(
            version,
            replaced = previous.as_ref().map(|p| p.version),
            "installed handshaker factory"
        );
        drop(previous);
        Ok(())
    }
}
