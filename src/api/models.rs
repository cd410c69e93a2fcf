//! Connection profile data model.
//!
//! A [`ConnectionProfile`] stores everything needed to reach one organization:
//! descriptive fields populated after the first successful connect,
//! authentication material (secrets only ever in encrypted form), and
//! non-persisted runtime state (the live session, the impersonation capability
//! memo, the in-memory metadata snapshot and its in-flight refresh handle).

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::connection_string::{
    ConnectionStringMap, MASKED_CLIENT_SECRET, MASKED_PASSWORD,
};
use crate::api::constants::{DEFAULT_REPLY_URL, DEFAULT_TIMEOUT, ONLINE_DOMAIN_SUFFIX};
use crate::api::metadata::{MetadataRefresh, MetadataSnapshot};
use crate::api::session::Session;
use crate::error::ConnectionError;
use crate::secret::SecretVault;

/// How a profile authenticates against the organization service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthKind {
    #[default]
    ActiveDirectory,
    Federation,
    OnlineFederation,
    OAuth,
    ClientSecret,
    Certificate,
    ConnectionString,
    RefreshToken,
}

/// Reference to a client certificate in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRef {
    pub issuer: String,
    pub name: String,
    pub thumbprint: String,
}

/// Live, non-persisted state attached to a profile.
#[derive(Default)]
pub(crate) struct ProfileRuntime {
    pub(crate) session: RwLock<Option<Arc<dyn Session>>>,
    /// Memoized impersonation capability for the current session.
    pub(crate) can_impersonate: Mutex<Option<bool>>,
    pub(crate) snapshot: RwLock<Option<Arc<MetadataSnapshot>>>,
    pub(crate) refresh: Mutex<Option<MetadataRefresh>>,
    pub(crate) impersonated_user: Mutex<Option<(Uuid, Option<String>)>>,
}

impl fmt::Debug for ProfileRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRuntime")
            .field("has_session", &self.session.read().unwrap().is_some())
            .field("can_impersonate", &*self.can_impersonate.lock().unwrap())
            .field("has_snapshot", &self.snapshot.read().unwrap().is_some())
            .finish_non_exhaustive()
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// A saved connection to one organization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Stable identity, assigned at creation and only replaced by an explicit
    /// clone.
    pub id: Uuid,
    pub name: String,

    // Descriptive fields, populated from the session after a successful connect.
    pub server_name: String,
    pub server_port: Option<u16>,
    pub original_url: String,
    pub web_application_url: Option<String>,
    pub organization: Option<String>,
    pub organization_friendly_name: Option<String>,
    pub organization_url_name: Option<String>,
    pub organization_service_url: Option<String>,
    pub organization_data_service_url: Option<String>,
    pub organization_version: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub environment_id: Option<String>,

    // Authentication.
    pub auth_kind: AuthKind,
    pub user_name: Option<String>,
    pub user_domain: Option<String>,
    pub encrypted_password: Option<String>,
    pub encrypted_client_secret: Option<String>,
    pub certificate: Option<CertificateRef>,
    pub app_id: Option<Uuid>,
    pub reply_url: Option<String>,
    pub refresh_token: Option<String>,
    pub home_realm_url: Option<String>,
    pub connection_string: Option<String>,
    /// Explicit credentials instead of the process' integrated ones.
    pub is_custom_auth: bool,
    pub use_mfa: bool,
    pub use_ifd: bool,
    /// Allows handing the stored secret to another consumer without re-prompting.
    pub allow_secret_sharing: bool,
    pub save_secrets: bool,
    /// Profile was provisioned by an out-of-band login flow and cannot
    /// establish a session on its own.
    pub from_external_login: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub last_used_on: Option<DateTime<Utc>>,

    #[serde(skip, default)]
    pub(crate) runtime: Arc<ProfileRuntime>,
}

impl ConnectionProfile {
    /// Fresh profile with a new identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            server_name: String::new(),
            server_port: None,
            original_url: String::new(),
            web_application_url: None,
            organization: None,
            organization_friendly_name: None,
            organization_url_name: None,
            organization_service_url: None,
            organization_data_service_url: None,
            organization_version: None,
            tenant_id: None,
            environment_id: None,
            auth_kind: AuthKind::default(),
            user_name: None,
            user_domain: None,
            encrypted_password: None,
            encrypted_client_secret: None,
            certificate: None,
            app_id: None,
            reply_url: None,
            refresh_token: None,
            home_realm_url: None,
            connection_string: None,
            is_custom_auth: false,
            use_mfa: false,
            use_ifd: false,
            allow_secret_sharing: false,
            save_secrets: false,
            from_external_login: false,
            timeout_secs: default_timeout_secs(),
            last_used_on: None,
            runtime: Arc::default(),
        }
    }

    // ----- derived, always recomputed -----

    /// SSL inferred from the connected or original URL scheme.
    pub fn use_ssl(&self) -> bool {
        let url = self
            .web_application_url
            .as_deref()
            .unwrap_or(&self.original_url);
        url.get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    }

    /// Hosted online organization, inferred from the URL suffix.
    pub fn use_online(&self) -> bool {
        host_of(&self.original_url)
            .map(|host| host.to_ascii_lowercase().ends_with(ONLINE_DOMAIN_SUFFIX))
            .unwrap_or(false)
    }

    pub fn organization_major_version(&self) -> Option<u32> {
        self.version_component(0)
    }

    pub fn organization_minor_version(&self) -> Option<u32> {
        self.version_component(1)
    }

    fn version_component(&self, index: usize) -> Option<u32> {
        self.organization_version
            .as_deref()?
            .split('.')
            .nth(index)?
            .parse()
            .ok()
    }

    pub fn uses_connection_string(&self) -> bool {
        self.connection_string
            .as_deref()
            .is_some_and(|cs| !cs.is_empty())
    }

    pub fn password_is_empty(&self) -> bool {
        self.encrypted_password.as_deref().unwrap_or("").is_empty()
    }

    pub fn client_secret_is_empty(&self) -> bool {
        self.encrypted_client_secret
            .as_deref()
            .unwrap_or("")
            .is_empty()
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Per-profile OAuth token cache location, derived from the identity.
    pub fn token_cache_path(&self) -> PathBuf {
        std::env::temp_dir()
            .join(format!("{{{}}}", self.id))
            .join("oauth-cache.txt")
    }

    // ----- lifecycle -----

    /// Copy of this profile under a new identity. Secrets are copied by value;
    /// runtime state (session, snapshot, capability memo) starts fresh.
    pub fn clone_with_new_id(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            server_name: self.server_name.clone(),
            server_port: self.server_port,
            original_url: self.original_url.clone(),
            web_application_url: self.web_application_url.clone(),
            organization: self.organization.clone(),
            organization_friendly_name: self.organization_friendly_name.clone(),
            organization_url_name: self.organization_url_name.clone(),
            organization_service_url: self.organization_service_url.clone(),
            organization_data_service_url: self.organization_data_service_url.clone(),
            organization_version: self.organization_version.clone(),
            tenant_id: self.tenant_id,
            environment_id: self.environment_id.clone(),
            auth_kind: self.auth_kind,
            user_name: self.user_name.clone(),
            user_domain: self.user_domain.clone(),
            encrypted_password: self.encrypted_password.clone(),
            encrypted_client_secret: self.encrypted_client_secret.clone(),
            certificate: self.certificate.clone(),
            app_id: self.app_id,
            reply_url: self.reply_url.clone(),
            refresh_token: self.refresh_token.clone(),
            home_realm_url: self.home_realm_url.clone(),
            connection_string: self.connection_string.clone(),
            is_custom_auth: self.is_custom_auth,
            use_mfa: self.use_mfa,
            use_ifd: self.use_ifd,
            allow_secret_sharing: self.allow_secret_sharing,
            save_secrets: self.save_secrets,
            from_external_login: self.from_external_login,
            timeout_secs: self.timeout_secs,
            last_used_on: self.last_used_on,
            runtime: Arc::default(),
        }
    }

    /// Replaces configuration from an edited copy while preserving the live
    /// session, capability memo, and cached metadata.
    pub fn update_after_edit(&mut self, edited: ConnectionProfile) {
        self.name = edited.name;
        self.connection_string = edited.connection_string;
        self.organization_service_url = edited.organization_service_url;
        self.organization_data_service_url = edited.organization_data_service_url;
        self.organization = edited.organization;
        self.organization_friendly_name = edited.organization_friendly_name;
        self.server_name = edited.server_name;
        self.server_port = edited.server_port;
        self.original_url = edited.original_url;
        self.use_ifd = edited.use_ifd;
        self.user_domain = edited.user_domain;
        self.user_name = edited.user_name;
        self.encrypted_password = edited.encrypted_password;
        self.encrypted_client_secret = edited.encrypted_client_secret;
        self.home_realm_url = edited.home_realm_url;
        self.timeout_secs = edited.timeout_secs;
        self.use_mfa = edited.use_mfa;
        self.reply_url = edited.reply_url;
        self.app_id = edited.app_id;
        self.refresh_token = edited.refresh_token;
        self.tenant_id = edited.tenant_id;
        self.environment_id = edited.environment_id;
        self.allow_secret_sharing = edited.allow_secret_sharing;
        self.is_custom_auth = edited.is_custom_auth;
        self.auth_kind = edited.auth_kind;
        self.certificate = edited.certificate;
    }

    /// Drops both stored secrets.
    pub fn erase_secrets(&mut self) {
        self.encrypted_password = None;
        self.encrypted_client_secret = None;
    }

    // ----- secret setters, always routed through the vault -----

    /// Stores the password encrypted. Client-secret profiles route the value
    /// into the client-secret slot instead.
    pub fn set_password(
        &mut self,
        vault: &SecretVault,
        password: &str,
        already_encrypted: bool,
    ) -> Result<(), ConnectionError> {
        if password.is_empty() {
            return Ok(());
        }
        let stored = if already_encrypted {
            password.to_string()
        } else {
            vault.encrypt(password)?
        };
        if self.auth_kind == AuthKind::ClientSecret {
            self.encrypted_client_secret = Some(stored);
        } else {
            self.encrypted_password = Some(stored);
        }
        Ok(())
    }

    pub fn set_client_secret(
        &mut self,
        vault: &SecretVault,
        secret: &str,
        already_encrypted: bool,
    ) -> Result<(), ConnectionError> {
        if secret.is_empty() {
            return Ok(());
        }
        self.encrypted_client_secret = Some(if already_encrypted {
            secret.to_string()
        } else {
            vault.encrypt(secret)?
        });
        Ok(())
    }

    /// Stores a raw connection string, encrypting any embedded `Password` or
    /// `ClientSecret` value first and remembering the target URL.
    pub fn set_connection_string(
        &mut self,
        vault: &SecretVault,
        raw: &str,
    ) -> Result<(), ConnectionError> {
        let mut map = ConnectionStringMap::parse(raw)?;

        self.original_url = map
            .get_first(&["ServiceUri", "Service Uri", "Url", "Server"])
            .unwrap_or("")
            .to_string();

        if let Some(password) = map.get("Password").map(str::to_string) {
            map.set("Password", &vault.encrypt(&password)?);
        }
        if let Some(secret) = map.get("ClientSecret").map(str::to_string) {
            map.set("ClientSecret", &vault.encrypt(&secret)?);
        }

        self.connection_string = Some(map.to_string());
        Ok(())
    }

    /// Hands this profile's encrypted password to another profile without
    /// decrypting it.
    pub fn copy_password_to(&self, other: &mut ConnectionProfile) {
        other.encrypted_password = self.encrypted_password.clone();
    }

    pub fn copy_client_secret_to(&self, other: &mut ConnectionProfile) {
        other.encrypted_client_secret = self.encrypted_client_secret.clone();
    }

    /// Whether `candidate` differs from the stored (encrypted) password.
    pub fn password_differs(&self, candidate: Option<&str>) -> bool {
        self.encrypted_password.as_deref() != candidate
    }

    // ----- runtime state -----

    /// Current live session, if one has been established.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.runtime.session.read().unwrap().clone()
    }

    /// Attaches an externally established session (out-of-band login flows).
    /// Resets the impersonation capability memo for the new session.
    pub fn attach_session(&self, session: Arc<dyn Session>) {
        *self.runtime.can_impersonate.lock().unwrap() = None;
        *self.runtime.session.write().unwrap() = Some(session);
    }

    /// Tears down the live session, the capability memo, and the in-memory
    /// metadata snapshot; the next resolve starts from scratch.
    pub fn teardown_session(&self) {
        *self.runtime.session.write().unwrap() = None;
        *self.runtime.can_impersonate.lock().unwrap() = None;
        *self.runtime.snapshot.write().unwrap() = None;
    }

    /// Memoized impersonation capability; `false` until the probe has run.
    pub fn can_impersonate(&self) -> bool {
        self.runtime.can_impersonate.lock().unwrap().unwrap_or(false)
    }

    pub(crate) fn impersonation_cached(&self) -> bool {
        self.runtime.can_impersonate.lock().unwrap().is_some()
    }

    pub(crate) fn cache_impersonation(&self, capable: bool) {
        *self.runtime.can_impersonate.lock().unwrap() = Some(capable);
    }

    /// In-memory metadata snapshot, if one is loaded.
    pub fn metadata(&self) -> Option<Arc<MetadataSnapshot>> {
        self.runtime.snapshot.read().unwrap().clone()
    }

    pub(crate) fn runtime_handle(&self) -> Arc<ProfileRuntime> {
        Arc::clone(&self.runtime)
    }

    // ----- impersonation -----

    /// Acts on behalf of `user_id` for subsequent calls on the live session.
    pub fn impersonate(
        &self,
        user_id: Uuid,
        user_name: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let session = self
            .session()
            .ok_or_else(|| ConnectionError::session("no live session to impersonate on"))?;
        session.set_caller_id(Some(user_id));
        *self.runtime.impersonated_user.lock().unwrap() =
            Some((user_id, user_name.map(str::to_string)));
        Ok(())
    }

    /// Stops acting on behalf of another user.
    pub fn remove_impersonation(&self) -> Result<(), ConnectionError> {
        let session = self
            .session()
            .ok_or_else(|| ConnectionError::session("no live session to impersonate on"))?;
        session.set_caller_id(None);
        *self.runtime.impersonated_user.lock().unwrap() = None;
        Ok(())
    }

    pub fn impersonated_user(&self) -> Option<(Uuid, Option<String>)> {
        self.runtime.impersonated_user.lock().unwrap().clone()
    }

    // ----- export -----

    /// Connection-string description of this profile. Secrets are always
    /// masked.
    pub fn to_connection_string(&self) -> String {
        let mut map = ConnectionStringMap::new();

        map.set(
            "AuthType",
            match self.auth_kind {
                AuthKind::OnlineFederation => "Office365",
                AuthKind::Federation => "IFD",
                _ => "AD",
            },
        );
        map.set(
            "Url",
            self.web_application_url
                .as_deref()
                .unwrap_or(&self.original_url),
        );

        if let Some(certificate) = &self.certificate {
            map.set("AuthType", "Certificate");
            map.set("ClientId", &self.app_id_string());
            map.set("Thumbprint", &certificate.thumbprint);
            return map.to_string();
        }

        if !self.client_secret_is_empty() {
            map.set("AuthType", "ClientSecret");
            map.set("ClientId", &self.braced_app_id());
            map.set("ClientSecret", MASKED_CLIENT_SECRET);
            return map.to_string();
        }

        if self.use_mfa {
            map.set("Username", self.user_name.as_deref().unwrap_or(""));
            map.set("AuthType", "OAuth");
            map.set("ClientId", &self.braced_app_id());
            map.set("LoginPrompt", "Auto");
            map.set(
                "RedirectUri",
                self.reply_url.as_deref().unwrap_or(DEFAULT_REPLY_URL),
            );
            map.set(
                "TokenCacheStorePath",
                &self.token_cache_path().to_string_lossy(),
            );
            return map.to_string();
        }

        if let Some(domain) = self.user_domain.as_deref().filter(|d| !d.is_empty()) {
            map.set("Domain", domain);
        }
        map.set("Username", self.user_name.as_deref().unwrap_or(""));
        map.set("Password", MASKED_PASSWORD);
        if let Some(realm) = self.home_realm_url.as_deref().filter(|r| !r.is_empty()) {
            map.set("HomeRealmUri", realm);
        }
        map.to_string()
    }

    fn app_id_string(&self) -> String {
        self.app_id.map(|id| id.to_string()).unwrap_or_default()
    }

    fn braced_app_id(&self) -> String {
        self.app_id
            .map(|id| format!("{{{id}}}"))
            .unwrap_or_default()
    }

    // ----- edit comparison -----

    /// True when an edit changed a field that invalidates the live session.
    pub fn connection_broken_by_edit(&self, original: Option<&ConnectionProfile>) -> bool {
        let Some(original) = original else {
            return true;
        };

        original.home_realm_url != self.home_realm_url
            || original.is_custom_auth != self.is_custom_auth
            || original.organization != self.organization
            || original.organization_url_name != self.organization_url_name
            || !original
                .server_name
                .eq_ignore_ascii_case(&self.server_name)
            || original.server_port != self.server_port
            || original.use_ifd != self.use_ifd
            || original.use_online() != self.use_online()
            || original.use_ssl() != self.use_ssl()
            || original.use_mfa != self.use_mfa
            || original.encrypted_client_secret != self.encrypted_client_secret
            || original.app_id != self.app_id
            || original.reply_url != self.reply_url
            || !eq_ignore_case_opt(original.user_domain.as_deref(), self.user_domain.as_deref())
            || !eq_ignore_case_opt(original.user_name.as_deref(), self.user_name.as_deref())
            || (self.save_secrets
                && !self.password_is_empty()
                && original.encrypted_password != self.encrypted_password)
            || original.certificate.as_ref().map(|c| &c.thumbprint)
                != self.certificate.as_ref().map(|c| &c.thumbprint)
    }
}

fn eq_ignore_case_opt(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Host portion of an URL, without scheme, port, or path.
pub(crate) fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?']).next()?;
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = host.split(':').next()?;
    if host.is_empty() { None } else { Some(host) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> SecretVault {
        SecretVault::new(crate::secret::KeyMaterial {
            passphrase: "test".into(),
            salt: "salt".into(),
            iterations: 10,
            ..Default::default()
        })
    }

    fn online_profile() -> ConnectionProfile {
        let mut profile = ConnectionProfile::new("contoso");
        profile.original_url = "https://contoso.crm.dynamics.com".into();
        profile
    }

    #[test]
    fn new_profiles_get_unique_ids() {
        assert_ne!(ConnectionProfile::new("a").id, ConnectionProfile::new("b").id);
    }

    #[test]
    fn ssl_and_online_are_derived_from_urls() {
        let profile = online_profile();
        assert!(profile.use_ssl());
        assert!(profile.use_online());

        let mut onprem = ConnectionProfile::new("onprem");
        onprem.original_url = "http://crm.contoso.local/org".into();
        assert!(!onprem.use_ssl());
        assert!(!onprem.use_online());
    }

    #[test]
    fn online_check_matches_host_suffix_only() {
        let mut profile = ConnectionProfile::new("tricky");
        profile.original_url = "https://evil.example.com/.dynamics.com".into();
        assert!(!profile.use_online());

        profile.original_url = "https://org.crm4.DYNAMICS.COM".into();
        assert!(profile.use_online());
    }

    #[test]
    fn version_components_parse_or_none() {
        let mut profile = ConnectionProfile::new("versioned");
        assert_eq!(profile.organization_major_version(), None);

        profile.organization_version = Some("9.2.24104.177".into());
        assert_eq!(profile.organization_major_version(), Some(9));
        assert_eq!(profile.organization_minor_version(), Some(2));

        profile.organization_version = Some("garbage".into());
        assert_eq!(profile.organization_major_version(), None);
    }

    #[test]
    fn clone_gets_new_id_and_copies_secrets() {
        let mut profile = online_profile();
        profile.set_client_secret(&vault(), "hunter2", false).unwrap();

        let copy = profile.clone_with_new_id();
        assert_ne!(copy.id, profile.id);
        assert_eq!(copy.encrypted_client_secret, profile.encrypted_client_secret);
        assert!(copy.session().is_none());
    }

    #[test]
    fn set_password_routes_to_secret_slot_for_client_secret_profiles() {
        let v = vault();
        let mut profile = ConnectionProfile::new("s2s");
        profile.auth_kind = AuthKind::ClientSecret;
        profile.set_password(&v, "value", false).unwrap();
        assert!(profile.password_is_empty());
        assert!(!profile.client_secret_is_empty());
    }

    #[test]
    fn set_connection_string_encrypts_embedded_secrets() {
        let v = vault();
        let mut profile = ConnectionProfile::new("cs");
        profile
            .set_connection_string(
                &v,
                "AuthType=OAuth;Url=https://org.crm.dynamics.com;Username=jane;Password=plain",
            )
            .unwrap();

        let stored = profile.connection_string.unwrap();
        assert!(!stored.contains("plain"));
        assert_eq!(profile.original_url, "https://org.crm.dynamics.com");

        let map = ConnectionStringMap::parse(&stored).unwrap();
        assert_eq!(v.decrypt(map.get("Password").unwrap()).unwrap(), "plain");
    }

    #[test]
    fn export_masks_password() {
        let mut profile = ConnectionProfile::new("ad");
        profile.user_name = Some("jane".into());
        profile.user_domain = Some("CONTOSO".into());
        profile.encrypted_password = Some("irrelevant".into());
        profile.original_url = "http://crm.contoso.local".into();

        let exported = profile.to_connection_string();
        assert!(exported.contains("Password=********"));
        assert!(!exported.contains("irrelevant"));
        assert!(exported.contains("Domain=CONTOSO"));
        assert!(exported.starts_with("AuthType=AD"));
    }

    #[test]
    fn export_masks_client_secret() {
        let mut profile = online_profile();
        profile.app_id = Some(Uuid::nil());
        profile.encrypted_client_secret = Some("whatever".into());

        let exported = profile.to_connection_string();
        assert!(exported.contains("AuthType=ClientSecret"));
        assert!(exported.contains(&format!("ClientSecret={MASKED_CLIENT_SECRET}")));
        assert!(exported.contains("ClientId={00000000-0000-0000-0000-000000000000}"));
        assert!(!exported.contains("whatever"));
    }

    #[test]
    fn export_prefers_certificate_over_secret() {
        let mut profile = online_profile();
        profile.encrypted_client_secret = Some("whatever".into());
        profile.certificate = Some(CertificateRef {
            issuer: "CN=Contoso CA".into(),
            name: "Contoso S2S".into(),
            thumbprint: "ABCDEF".into(),
        });

        let exported = profile.to_connection_string();
        assert!(exported.contains("AuthType=Certificate"));
        assert!(exported.contains("Thumbprint=ABCDEF"));
    }

    #[test]
    fn update_after_edit_preserves_identity() {
        let mut profile = online_profile();
        let id = profile.id;

        let mut edited = profile.clone_with_new_id();
        edited.name = "renamed".into();
        edited.use_mfa = true;

        profile.update_after_edit(edited);
        assert_eq!(profile.id, id);
        assert_eq!(profile.name, "renamed");
        assert!(profile.use_mfa);
    }

    #[test]
    fn broken_edit_detection() {
        let original = online_profile();

        let mut same = original.clone_with_new_id();
        same.name = "renamed only".into();
        assert!(!same.connection_broken_by_edit(Some(&original)));

        let mut moved = original.clone_with_new_id();
        moved.server_name = "elsewhere".into();
        assert!(moved.connection_broken_by_edit(Some(&original)));

        assert!(original.connection_broken_by_edit(None));
    }

    #[test]
    fn host_of_handles_ports_and_paths() {
        assert_eq!(host_of("https://a.b.com:8443/x"), Some("a.b.com"));
        assert_eq!(host_of("http://a.b.com"), Some("a.b.com"));
        assert_eq!(host_of("a.b.com/path"), Some("a.b.com"));
        assert_eq!(host_of("https://"), None);
    }
}
