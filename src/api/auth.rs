//! Connection resolution: turns a profile into a live, ready session.
//!
//! Strategies form an ordered priority list; the first one whose predicate
//! matches the profile is used. Selection is pure and unit-testable; only the
//! chosen strategy's build step touches the network.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use uuid::Uuid;

use crate::api::client::RefreshTokenOverride;
use crate::api::connection_string::ConnectionStringMap;
use crate::api::constants::{DEFAULT_APP_ID, DEFAULT_REPLY_URL};
use crate::api::impersonation::ImpersonationProbe;
use crate::api::models::{AuthKind, ConnectionProfile, host_of};
use crate::api::session::{
    AuthMechanism, AuthOverride, NetworkCredentials, OnPremKind, OnPremParams, OnlineParams,
    Session, SessionFactory, install_auth_override,
};
use crate::error::ConnectionError;
use crate::secret::SecretVault;

/// One way of building a session from a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Provisioned by an out-of-band login flow; cannot self-establish.
    ExternallyProvisioned,
    /// Client certificate plus application id.
    Certificate,
    /// Raw connection string, used as-is after secret decryption.
    ConnectionString,
    /// Service-to-service client-secret exchange.
    ClientSecret,
    /// Interactive OAuth with multi-factor authentication.
    OAuthMfa,
    /// Stored secret without an explicit kind; prefers a refresh token.
    StoredSecret,
    /// Hosted online organization, interactive credential flow.
    Online,
    /// Claims-federated (IFD) server.
    Federation,
    /// On-premises integrated or explicit Active Directory credentials.
    OnPremises,
}

/// Fixed resolution order. The final entry matches every profile.
pub const STRATEGY_ORDER: [AuthStrategy; 9] = [
    AuthStrategy::ExternallyProvisioned,
    AuthStrategy::Certificate,
    AuthStrategy::ConnectionString,
    AuthStrategy::ClientSecret,
    AuthStrategy::OAuthMfa,
    AuthStrategy::StoredSecret,
    AuthStrategy::Online,
    AuthStrategy::Federation,
    AuthStrategy::OnPremises,
];

impl AuthStrategy {
    /// Whether this strategy applies to `profile`.
    pub fn applies_to(&self, profile: &ConnectionProfile) -> bool {
        match self {
            AuthStrategy::ExternallyProvisioned => profile.from_external_login,
            AuthStrategy::Certificate => profile.certificate.is_some(),
            AuthStrategy::ConnectionString => profile.uses_connection_string(),
            AuthStrategy::ClientSecret => profile.auth_kind == AuthKind::ClientSecret,
            AuthStrategy::OAuthMfa => profile.auth_kind == AuthKind::OAuth && profile.use_mfa,
            AuthStrategy::StoredSecret => !profile.client_secret_is_empty(),
            AuthStrategy::Online => profile.use_online(),
            AuthStrategy::Federation => profile.use_ifd,
            AuthStrategy::OnPremises => true,
        }
    }
}

/// First strategy in priority order that applies to `profile`.
pub fn select_strategy(profile: &ConnectionProfile) -> AuthStrategy {
    STRATEGY_ORDER
        .iter()
        .copied()
        .find(|strategy| strategy.applies_to(profile))
        .unwrap_or(AuthStrategy::OnPremises)
}

/// Resolves profiles into live, ready sessions.
pub struct AuthResolver {
    factory: Arc<dyn SessionFactory>,
    vault: SecretVault,
    mfa_override: Option<Arc<dyn AuthOverride>>,
}

impl AuthResolver {
    pub fn new(factory: Arc<dyn SessionFactory>, vault: SecretVault) -> Self {
        Self {
            factory,
            vault,
            mfa_override: None,
        }
    }

    /// Token provider consulted during multi-factor sign-in, typically wired
    /// to the surrounding application's interactive login.
    pub fn with_mfa_override(mut self, hook: Arc<dyn AuthOverride>) -> Self {
        self.mfa_override = Some(hook);
        self
    }

    /// Returns the profile's live session, building one if needed.
    ///
    /// Without `force_new`, an existing session is returned as-is (after
    /// filling the impersonation capability memo if it was never computed).
    /// With `force_new`, the current session and in-memory metadata snapshot
    /// are torn down first. Failures are fatal for the attempt: the broken
    /// session is discarded, never cached.
    pub async fn resolve(
        &self,
        profile: &mut ConnectionProfile,
        force_new: bool,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        if !force_new {
            if let Some(session) = profile.session() {
                ImpersonationProbe::ensure(profile, session.as_ref()).await;
                return Ok(session);
            }
        }

        let strategy = select_strategy(profile);
        debug!(
            "resolving profile {} ({}) via {strategy:?}",
            profile.name, profile.id
        );

        if strategy == AuthStrategy::ExternallyProvisioned {
            // Such sessions are handed to us fully built; all we can do is
            // return the one we have.
            if let Some(session) = profile.session() {
                ImpersonationProbe::ensure(profile, session.as_ref()).await;
                return Ok(session);
            }
            return Err(ConnectionError::configuration(
                "profiles provisioned by an external login flow cannot establish a session on their own",
            ));
        }

        profile.teardown_session();

        let session = self.build(strategy, profile).await?;

        if !session.is_ready() {
            let message = session
                .last_error()
                .unwrap_or_else(|| "the session did not report ready".to_string());
            return Err(ConnectionError::Session(message));
        }

        profile.attach_session(Arc::clone(&session));
        ImpersonationProbe::ensure(profile, session.as_ref()).await;
        populate_from_session(profile, session.as_ref());
        info!(
            "connected profile {} to {}",
            profile.name,
            profile.organization.as_deref().unwrap_or("<unknown>")
        );

        Ok(session)
    }

    async fn build(
        &self,
        strategy: AuthStrategy,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        match strategy {
            AuthStrategy::ExternallyProvisioned => unreachable!("handled before build"),
            AuthStrategy::Certificate => self.build_certificate(profile).await,
            AuthStrategy::ConnectionString => self.build_connection_string(profile).await,
            AuthStrategy::ClientSecret => self.build_client_secret(profile).await,
            AuthStrategy::OAuthMfa => self.build_mfa(profile).await,
            AuthStrategy::StoredSecret => self.build_stored_secret(profile).await,
            AuthStrategy::Online => self.build_online(profile).await,
            AuthStrategy::Federation => self.build_on_premises(profile, OnPremKind::Ifd).await,
            AuthStrategy::OnPremises => {
                self.build_on_premises(profile, OnPremKind::ActiveDirectory)
                    .await
            }
        }
    }

    async fn build_certificate(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let certificate = profile
            .certificate
            .clone()
            .ok_or_else(|| ConnectionError::configuration("profile has no certificate reference"))?;
        let raw = format!(
            "AuthType=Certificate;url={};thumbprint={};ClientId={}",
            profile.original_url,
            certificate.thumbprint,
            profile.app_id.map(|id| id.to_string()).unwrap_or_default(),
        );
        let (prepared, timeout) = self.prepare_connection_string(profile, &raw)?;
        self.factory.from_connection_string(&prepared, timeout).await
    }

    async fn build_connection_string(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let raw = profile
            .connection_string
            .clone()
            .ok_or_else(|| ConnectionError::configuration("profile has no connection string"))?;
        let (prepared, timeout) = self.prepare_connection_string(profile, &raw)?;
        self.factory.from_connection_string(&prepared, timeout).await
    }

    async fn build_client_secret(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let app_id = profile.app_id.ok_or_else(|| {
            ConnectionError::configuration("client-secret authentication requires an application id")
        })?;
        let secret =
            self.decrypt_required(profile.encrypted_client_secret.as_deref(), "client secret")?;
        // Built key by key: the decrypted secret must never pass through the
        // string parser.
        let mut map = ConnectionStringMap::new();
        map.set("AuthType", "ClientSecret");
        map.set("url", &profile.original_url);
        map.set("ClientId", &app_id.to_string());
        map.set("ClientSecret", &secret);
        map.ensure("RequireNewInstance", "True");
        self.factory
            .from_connection_string(&map.to_string(), profile.timeout())
            .await
    }

    async fn build_mfa(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let hook = self.mfa_override.clone().ok_or_else(|| {
            ConnectionError::configuration(
                "multi-factor sign-in requires an interactive token provider; none is configured",
            )
        })?;
        let _guard = install_auth_override(hook);
        self.factory
            .interactive(&profile.original_url, profile.timeout())
            .await
    }

    async fn build_stored_secret(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let url = server_url(profile);

        if let Some(refresh_token) = profile
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
        {
            let app_id = profile.app_id.unwrap_or_else(default_app_id);
            let hook = Arc::new(RefreshTokenOverride::new(refresh_token, app_id));
            let _guard = install_auth_override(hook);
            return self.factory.interactive(&url, profile.timeout()).await;
        }

        let app_id = profile.app_id.ok_or_else(|| {
            ConnectionError::configuration("client-secret authentication requires an application id")
        })?;
        let secret =
            self.decrypt_required(profile.encrypted_client_secret.as_deref(), "client secret")?;
        self.factory
            .with_client_secret(
                &url,
                app_id,
                &secret,
                profile.token_cache_path(),
                profile.timeout(),
            )
            .await
    }

    async fn build_online(
        &self,
        profile: &mut ConnectionProfile,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let user_name = profile
            .user_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ConnectionError::configuration("online authentication requires a user name")
            })?;
        let password =
            self.decrypt_required(profile.encrypted_password.as_deref(), "user password")?;

        let params = OnlineParams {
            url: profile.original_url.clone(),
            user_name,
            password,
            app_id: profile.app_id.unwrap_or_else(default_app_id),
            reply_url: profile
                .reply_url
                .clone()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_REPLY_URL.to_string()),
            token_cache_path: profile.token_cache_path(),
        };
        self.factory.online(params, profile.timeout()).await
    }

    async fn build_on_premises(
        &self,
        profile: &mut ConnectionProfile,
        kind: OnPremKind,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let credentials = if profile.is_custom_auth {
            let user_name = profile
                .user_name
                .clone()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    ConnectionError::configuration("explicit credentials require a user name")
                })?;
            let password =
                self.decrypt_required(profile.encrypted_password.as_deref(), "user password")?;
            Some(NetworkCredentials {
                user_name,
                password,
                domain: profile.user_domain.clone(),
            })
        } else {
            None
        };

        let params = OnPremParams {
            kind,
            credentials,
            server_name: profile.server_name.clone(),
            server_port: profile.server_port,
            organization_url_name: profile.organization_url_name.clone(),
            home_realm_url: if kind == OnPremKind::Ifd {
                profile.home_realm_url.clone()
            } else {
                None
            },
            use_ssl: profile.use_ssl(),
        };
        self.factory
            .with_network_credentials(params, profile.timeout())
            .await
    }

    /// Prepares a raw connection string for the factory: pulls the target URL
    /// and user name onto the profile, decrypts embedded secrets, honors an
    /// embedded timeout, and forces a new service instance per call so
    /// connections are never silently pooled across unrelated callers.
    fn prepare_connection_string(
        &self,
        profile: &mut ConnectionProfile,
        raw: &str,
    ) -> Result<(String, Duration), ConnectionError> {
        let mut map = ConnectionStringMap::parse(raw)?;

        let mut timeout = profile.timeout();
        if let Some(value) = map.remove("timeout") {
            timeout = parse_timeout(&value).ok_or_else(|| {
                ConnectionError::configuration(format!(
                    "unrecognized connection string timeout: {value:?}"
                ))
            })?;
        }

        if let Some(url) = map.get_first(&["ServiceUri", "Service Uri", "Url", "Server"]) {
            profile.original_url = url.to_string();
        }
        profile.user_name = map
            .get("username")
            .or_else(|| map.get("clientid"))
            .map(str::to_string);

        if let Some(password) = map.get("Password").map(str::to_string) {
            map.set("Password", &self.vault.decrypt(&password)?);
        }
        if let Some(secret) = map.get("ClientSecret").map(str::to_string) {
            map.set("ClientSecret", &self.vault.decrypt(&secret)?);
        }

        map.ensure("RequireNewInstance", "True");
        Ok((map.to_string(), timeout))
    }

    fn decrypt_required(
        &self,
        stored: Option<&str>,
        what: &str,
    ) -> Result<String, ConnectionError> {
        let stored = stored
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConnectionError::configuration(format!("profile has no stored {what}")))?;
        self.vault.decrypt(stored)
    }
}

/// Copies the connected organization's identity back onto the profile and maps
/// the mechanism the session actually used onto the displayed kind.
fn populate_from_session(profile: &mut ConnectionProfile, session: &dyn Session) {
    let endpoints = session.endpoints();
    let organization = session.organization();

    profile.organization = Some(organization.unique_name);
    profile.organization_friendly_name = Some(organization.friendly_name);
    if organization.url_name.is_some() {
        profile.organization_url_name = organization.url_name;
    }
    profile.organization_version = Some(organization.version);
    profile.tenant_id = organization.tenant_id;
    profile.environment_id = organization.environment_id;

    profile.organization_service_url = Some(endpoints.organization_service);
    profile.organization_data_service_url = Some(endpoints.organization_data_service);

    if let Some((host, port)) = host_and_port(&endpoints.web_application) {
        profile.server_name = host;
        profile.server_port = Some(port);
    }
    profile.web_application_url = Some(endpoints.web_application);

    match session.auth_mechanism() {
        AuthMechanism::ActiveDirectory | AuthMechanism::Claims => {
            profile.auth_kind = AuthKind::ActiveDirectory;
        }
        AuthMechanism::Ifd => profile.auth_kind = AuthKind::Federation,
        AuthMechanism::Live | AuthMechanism::Office365 => {
            profile.auth_kind = AuthKind::OnlineFederation;
        }
        AuthMechanism::Certificate => profile.auth_kind = AuthKind::Certificate,
        AuthMechanism::ClientSecret => profile.auth_kind = AuthKind::ClientSecret,
        // OAuth sessions keep whatever kind the profile was configured with.
        AuthMechanism::OAuth => {}
    }
}

fn default_app_id() -> Uuid {
    Uuid::from_str(DEFAULT_APP_ID).expect("well-known application id parses")
}

/// `https://server:port` built from the profile's server fields, falling back
/// to the original URL when no server name is known yet.
fn server_url(profile: &ConnectionProfile) -> String {
    if profile.server_name.is_empty() {
        return profile.original_url.clone();
    }
    let scheme = if profile.use_ssl() { "https" } else { "http" };
    match profile.server_port {
        Some(port) => format!("{scheme}://{}:{port}", profile.server_name),
        None => format!("{scheme}://{}", profile.server_name),
    }
}

/// Host and (defaulted) port of an URL.
fn host_and_port(url: &str) -> Option<(String, u16)> {
    let host = host_of(url)?.to_string();
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?']).next()?;
    let explicit = authority
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok());
    let default = if url
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    {
        443
    } else {
        80
    };
    Some((host, explicit.unwrap_or(default)))
}

/// Accepts plain seconds or `HH:MM:SS`.
fn parse_timeout(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}
