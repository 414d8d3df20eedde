// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Bridge between a connector's [`KeyMaterials`] and an external
//! [`CredentialReload`] source.

#[cfg(feature = "tracing")]
use tracing::{debug, error};

use crate::{Error, KeyMaterials, Result};

/// Outcome of a credential reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    /// Key material did not change; the live handshaker factory stays.
    Unchanged,
    /// New key material was installed; the factory must be rebuilt.
    New,
    /// The reload failed. Existing material, if any, stays in use.
    Fail,
}

/// How a [`CredentialReload`] handled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadSchedule {
    /// The request was filled in before `schedule` returned.
    Completed,
    /// The source wants to finish later. Not supported: treated as a no-op
    /// when material is already present, as an error otherwise.
    Pending,
}

/// A single reload request handed to a [`CredentialReload`].
///
/// The request borrows the connector's current material for inspection. The
/// source answers by calling exactly one of [`set_key_materials`],
/// [`set_unchanged`] or [`fail`]; a request left untouched reads as
/// [`ReloadStatus::Unchanged`].
///
/// [`set_key_materials`]: Self::set_key_materials
/// [`set_unchanged`]: Self::set_unchanged
/// [`fail`]: Self::fail
#[derive(Debug)]
pub struct CredentialReloadRequest<'a> {
    current: &'a KeyMaterials,
    status: ReloadStatus,
    key_materials: Option<KeyMaterials>,
    error_details: Option<String>,
}

impl<'a> CredentialReloadRequest<'a> {
    pub(crate) const fn new(current: &'a KeyMaterials) -> Self {
        Self {
            current,
            status: ReloadStatus::Unchanged,
            key_materials: None,
            error_details: None,
        }
    }

    /// Material the connector currently holds.
    #[must_use]
    pub const fn current(&self) -> &KeyMaterials {
        self.current
    }

    /// Replace the connector's material wholesale.
    pub fn set_key_materials(&mut self, key_materials: KeyMaterials) {
        self.key_materials = Some(key_materials);
        self.status = ReloadStatus::New;
    }

    /// Report that nothing changed since the last reload.
    pub fn set_unchanged(&mut self) {
        self.key_materials = None;
        self.status = ReloadStatus::Unchanged;
    }

    /// Report a failed reload with a human readable reason.
    pub fn fail(&mut self, details: impl Into<String>) {
        self.key_materials = None;
        self.error_details = Some(details.into());
        self.status = ReloadStatus::Fail;
    }

    /// Status recorded so far.
    #[must_use]
    pub const fn status(&self) -> ReloadStatus {
        self.status
    }
}

/// External source of key material.
///
/// Implementations must answer synchronously. Returning
/// [`ReloadSchedule::Pending`] is tolerated only while the connector still
/// has usable material.
pub trait CredentialReload: Send + Sync {
    /// Fill in `request` with the result of a reload.
    fn schedule(&self, request: &mut CredentialReloadRequest<'_>) -> ReloadSchedule;
}

/// Refresh `store` from `reload`, degrading to the existing material when
/// the source fails but the store is still usable.
pub(crate) fn fetch_key_materials(
    store: &mut KeyMaterials,
    reload: Option<&dyn CredentialReload>,
) -> Result<ReloadStatus> {
    let is_empty = store.is_empty();
    let Some(reload) = reload else {
        if is_empty {
            #[cfg(feature = "tracing")]
            error!("either a credential reload source or key materials should be provisioned");
            return Err(Error::FailedPrecondition(
                "no key material source: neither credential reload nor key materials provisioned"
                    .into(),
            ));
        }
        return Ok(ReloadStatus::Unchanged);
    };

    let mut request = CredentialReloadRequest::new(store);
    if reload.schedule(&mut request) == ReloadSchedule::Pending {
        #[cfg(feature = "tracing")]
        error!("asynchronous credential reload is unsupported");
        if is_empty {
            return Err(Error::Unimplemented(
                "asynchronous credential reload is unsupported".into(),
            ));
        }
        return Ok(ReloadStatus::Unchanged);
    }

    let CredentialReloadRequest {
        status,
        key_materials,
        error_details,
        ..
    } = request;
    match status {
        ReloadStatus::Unchanged => {
            #[cfg(feature = "tracing")]
            debug!("credential does not change after reload");
            Ok(ReloadStatus::Unchanged)
        }
        ReloadStatus::Fail => {
            let details = error_details.unwrap_or_default();
            #[cfg(feature = "tracing")]
            error!(%details, "credential reload failed");
            if is_empty {
                return Err(Error::Internal(format!(
                    "credential reload failed with error: {details}"
                )));
            }
            Ok(ReloadStatus::Fail)
        }
        ReloadStatus::New => {
            if let Some(key_materials) = key_materials {
                *store = key_materials;
            }
            Ok(ReloadStatus::New)
        }
    }
}
