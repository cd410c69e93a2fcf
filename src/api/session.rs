//! Seam to the transport library that owns live organization sessions.
//!
//! The resolver and metadata cache only ever talk to [`Session`] and
//! [`SessionFactory`]; the built-in Web API client implements both, and tests
//! substitute mocks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::api::metadata::EntityDescriptor;
use crate::error::{ConnectionError, ServiceFault};

/// Authentication mechanism a live session actually negotiated.
///
/// This can differ from the profile's configured kind; after connecting it is
/// mapped back onto the profile for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    ActiveDirectory,
    Claims,
    Ifd,
    Live,
    OAuth,
    Office365,
    Certificate,
    ClientSecret,
}

/// Endpoint URLs published by a connected organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationEndpoints {
    pub organization_service: String,
    pub organization_data_service: String,
    pub web_application: String,
}

/// Identity of a connected organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationInfo {
    pub unique_name: String,
    pub friendly_name: String,
    pub url_name: Option<String>,
    pub version: String,
    pub tenant_id: Option<Uuid>,
    pub environment_id: Option<String>,
}

/// Payload of a metadata-changes query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataChanges {
    pub entities: Vec<EntityDescriptor>,
    pub server_version_stamp: String,
}

/// A live, authenticated handle to one organization.
#[async_trait]
pub trait Session: Send + Sync + std::fmt::Debug {
    /// True once the session is connected and usable.
    fn is_ready(&self) -> bool;

    /// Last error reported while connecting, if any.
    fn last_error(&self) -> Option<String>;

    fn auth_mechanism(&self) -> AuthMechanism;

    fn endpoints(&self) -> OrganizationEndpoints;

    fn organization(&self) -> OrganizationInfo;

    /// Impersonate another user on subsequent calls; `None` clears it.
    fn set_caller_id(&self, caller: Option<Uuid>);

    /// Runs a read-only FetchXML query and returns the raw rows.
    async fn fetch(&self, fetch_xml: &str) -> Result<Vec<serde_json::Value>, ServiceFault>;

    /// Executes a metadata-changes query, incremental when a version stamp is
    /// supplied.
    async fn retrieve_metadata_changes(
        &self,
        client_version_stamp: Option<&str>,
    ) -> Result<MetadataChanges, ServiceFault>;

    /// Independent session sharing this session's authentication, so
    /// background work cannot block foreground use.
    async fn clone_session(&self) -> Result<Arc<dyn Session>, ServiceFault>;
}

/// Explicit network credentials for on-premises and federated servers.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub user_name: String,
    pub password: String,
    pub domain: Option<String>,
}

impl std::fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Hosted online credential flow parameters.
#[derive(Clone)]
pub struct OnlineParams {
    pub url: String,
    pub user_name: String,
    pub password: String,
    pub app_id: Uuid,
    pub reply_url: String,
    pub token_cache_path: PathBuf,
}

impl std::fmt::Debug for OnlineParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineParams")
            .field("url", &self.url)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("app_id", &self.app_id)
            .field("reply_url", &self.reply_url)
            .field("token_cache_path", &self.token_cache_path)
            .finish()
    }
}

/// Flavor of on-premises authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnPremKind {
    ActiveDirectory,
    Ifd,
}

/// On-premises / federated server parameters. `credentials: None` means the
/// process' integrated default credentials.
#[derive(Debug, Clone)]
pub struct OnPremParams {
    pub kind: OnPremKind,
    pub credentials: Option<NetworkCredentials>,
    pub server_name: String,
    pub server_port: Option<u16>,
    pub organization_url_name: Option<String>,
    pub home_realm_url: Option<String>,
    pub use_ssl: bool,
}

/// Builds sessions from resolved profile material.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Builds from a fully prepared connection string (secrets already
    /// decrypted, `RequireNewInstance` forced).
    async fn from_connection_string(
        &self,
        connection_string: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError>;

    /// Interactive OAuth against `url`, honoring any installed auth override.
    async fn interactive(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError>;

    /// OAuth client-secret exchange with a per-profile token cache.
    async fn with_client_secret(
        &self,
        url: &str,
        app_id: Uuid,
        client_secret: &str,
        token_cache_path: PathBuf,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError>;

    /// Hosted online credential flow.
    async fn online(&self, params: OnlineParams, timeout: Duration)
    -> Result<Arc<dyn Session>, ConnectionError>;

    /// On-premises or federated server with integrated or explicit credentials.
    async fn with_network_credentials(
        &self,
        params: OnPremParams,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError>;
}

/// Token provider consulted by interactive session construction instead of
/// prompting.
#[async_trait]
pub trait AuthOverride: Send + Sync {
    /// Acquires an access token for `resource`.
    async fn acquire_token(&self, resource: &str) -> Result<String, ConnectionError>;
}

static AUTH_OVERRIDE: Lazy<Mutex<Option<Arc<dyn AuthOverride>>>> = Lazy::new(|| Mutex::new(None));

/// Currently installed process-wide auth override, if any.
pub fn current_auth_override() -> Option<Arc<dyn AuthOverride>> {
    AUTH_OVERRIDE.lock().expect("auth override lock poisoned").clone()
}

/// Installs `hook` process-wide until the returned guard is dropped.
///
/// The hook is removed on every exit path, including panics and early returns,
/// because removal happens in the guard's `Drop`.
#[must_use = "dropping the guard immediately uninstalls the override"]
pub fn install_auth_override(hook: Arc<dyn AuthOverride>) -> AuthOverrideGuard {
    *AUTH_OVERRIDE.lock().expect("auth override lock poisoned") = Some(hook);
    AuthOverrideGuard { _priv: () }
}

/// Scope guard for an installed [`AuthOverride`].
pub struct AuthOverrideGuard {
    _priv: (),
}

impl Drop for AuthOverrideGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = AUTH_OVERRIDE.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticToken;

    #[async_trait]
    impl AuthOverride for StaticToken {
        async fn acquire_token(&self, _resource: &str) -> Result<String, ConnectionError> {
            Ok("token".into())
        }
    }

    #[test]
    fn override_is_removed_when_guard_drops() {
        assert!(current_auth_override().is_none());
        {
            let _guard = install_auth_override(Arc::new(StaticToken));
            assert!(current_auth_override().is_some());
        }
        assert!(current_auth_override().is_none());
    }
}
