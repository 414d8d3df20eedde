// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{fmt, sync::Arc};

use crate::{
    AuthorizationCheck, ClientCertRequestType, CredentialReload, KeyMaterials, RustlsEngine,
    TlsEngine,
};

/// Configuration shared by every connector created from one set of
/// credentials.
///
/// Build with [`TlsCredentialsOptions::builder`]:
///
/// ```rust
/// use rustls_spiffe_connector::{ClientCertRequestType, KeyCertPair, KeyMaterials, TlsCredentialsOptions};
///
/// let options = TlsCredentialsOptions::builder()
///     .key_materials(KeyMaterials::new(
///         Some(b"-----BEGIN CERTIFICATE-----...".to_vec()),
///         vec![KeyCertPair::new(b"cert".to_vec(), b"key".to_vec())],
///     ))
///     .cert_request_type(ClientCertRequestType::RequestAndVerify)
///     .build();
/// assert!(options.authorization_check().is_none());
/// ```
pub struct TlsCredentialsOptions {
    key_materials: Option<KeyMaterials>,
    credential_reload: Option<Arc<dyn CredentialReload>>,
    authorization_check: Option<Arc<dyn AuthorizationCheck>>,
    cert_request_type: ClientCertRequestType,
    engine: Arc<dyn TlsEngine>,
}

impl TlsCredentialsOptions {
    /// Start building options. Defaults: no key material, no reload source,
    /// no authorization check, [`ClientCertRequestType::RequireAndVerify`],
    /// [`RustlsEngine`].
    #[must_use]
    pub fn builder() -> TlsCredentialsOptionsBuilder {
        TlsCredentialsOptionsBuilder::default()
    }

    /// Statically configured key material.
    #[must_use]
    pub const fn key_materials(&self) -> Option<&KeyMaterials> {
        self.key_materials.as_ref()
    }

    /// Source consulted on every factory initialization and refresh.
    #[must_use]
    pub fn credential_reload(&self) -> Option<&dyn CredentialReload> {
        self.credential_reload.as_deref()
    }

    /// Check run against the server's identity by channel connectors.
    #[must_use]
    pub const fn authorization_check(&self) -> Option<&Arc<dyn AuthorizationCheck>> {
        self.authorization_check.as_ref()
    }

    /// Client certificate policy of server connectors.
    #[must_use]
    pub const fn cert_request_type(&self) -> ClientCertRequestType {
        self.cert_request_type
    }

    /// Engine that builds handshaker factories.
    #[must_use]
    pub fn engine(&self) -> &dyn TlsEngine {
        self.engine.as_ref()
    }
}

impl fmt::Debug for TlsCredentialsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredentialsOptions")
            .field("key_materials", &self.key_materials)
            .field("credential_reload", &self.credential_reload.is_some())
            .field("authorization_check", &self.authorization_check.is_some())
            .field("cert_request_type", &self.cert_request_type)
            .field("engine", &self.engine)
            .finish()
    }
}

/// Builder for [`TlsCredentialsOptions`].
pub struct TlsCredentialsOptionsBuilder {
    key_materials: Option<KeyMaterials>,
    credential_reload: Option<Arc<dyn CredentialReload>>,
    authorization_check: Option<Arc<dyn AuthorizationCheck>>,
    cert_request_type: ClientCertRequestType,
    engine: Arc<dyn TlsEngine>,
}

impl Default for TlsCredentialsOptionsBuilder {
    fn default() -> Self {
        Self {
            key_materials: None,
            credential_reload: None,
            authorization_check: None,
            cert_request_type: ClientCertRequestType::default(),
            engine: Arc::new(RustlsEngine::new()),
        }
    }
}

impl TlsCredentialsOptionsBuilder {
    /// Statically configured root certificates and identities.
    #[must_use]
    pub fn key_materials(mut self, key_materials: KeyMaterials) -> Self {
        self.key_materials = Some(key_materials);
        self
    }

    /// Source of hot-reloaded key material.
    #[must_use]
    pub fn credential_reload(mut self, reload: Arc<dyn CredentialReload>) -> Self {
        self.credential_reload = Some(reload);
        self
    }

    /// Check applied to the server identity on the client side.
    #[must_use]
    pub fn authorization_check(mut self, check: Arc<dyn AuthorizationCheck>) -> Self {
        self.authorization_check = Some(check);
        self
    }

    /// Client certificate policy on the server side.
    #[must_use]
    pub const fn cert_request_type(mut self, cert_request_type: ClientCertRequestType) -> Self {
        self.cert_request_type = cert_request_type;
        self
    }

    /// Replace the default [`RustlsEngine`].
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn TlsEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> TlsCredentialsOptions {
        TlsCredentialsOptions {
            key_materials: self.key_materials,
            credential_reload: self.credential_reload,
            authorization_check: self.authorization_check,
            cert_request_type: self.cert_request_type,
            engine: self.engine,
        }
    }
}
