//! Built-in Web API transport.
//!
//! Implements [`Session`] and [`SessionFactory`] over reqwest for the
//! non-interactive flows (client secret, connection string, online password
//! grant, refresh token). Interactive sign-in and integrated Windows
//! authentication need facilities this client does not have; those factory
//! methods fail with a descriptive error unless an auth override is installed.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use uuid::Uuid;

use crate::api::connection_string::ConnectionStringMap;
use crate::api::constants::{self, TOKEN_ENDPOINT, headers};
use crate::api::metadata::{AttributeDescriptor, EntityDescriptor};
use crate::api::session::{
    AuthMechanism, AuthOverride, MetadataChanges, OnPremParams, OnlineParams,
    OrganizationEndpoints, OrganizationInfo, Session, SessionFactory, current_auth_override,
};
use crate::error::{ConnectionError, ServiceFault};

/// Builds [`WebApiSession`]s for the flows this transport supports.
#[derive(Debug, Default)]
pub struct WebApiFactory;

impl WebApiFactory {
    pub fn new() -> Self {
        Self
    }

    fn http_client(timeout: Duration) -> Result<reqwest::Client, ConnectionError> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("dynamics-connection/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| ConnectionError::session(format!("failed to build HTTP client: {error}")))
    }

    async fn acquire_token(
        http: &reqwest::Client,
        form: &[(&str, &str)],
    ) -> Result<String, ConnectionError> {
        let response = http
            .post(TOKEN_ENDPOINT)
            .form(form)
            .send()
            .await
            .map_err(|error| ConnectionError::session(format!("token request failed: {error}")))?;

        debug!("token request status: {}", response.status());

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ConnectionError::session(format!(
                "authentication failed: {error_text}"
            )));
        }

        let token_data: Value = response
            .json()
            .await
            .map_err(|error| ConnectionError::session(format!("malformed token response: {error}")))?;
        token_data
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConnectionError::session("no access token in response"))
    }

    async fn connect(
        &self,
        base_url: &str,
        access_token: String,
        mechanism: AuthMechanism,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let http = Self::http_client(timeout)?;
        let session = WebApiSession::connect(http, base_url, access_token, mechanism).await;
        Ok(Arc::new(session))
    }
}

#[async_trait]
impl SessionFactory for WebApiFactory {
    async fn from_connection_string(
        &self,
        connection_string: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let map = ConnectionStringMap::parse(connection_string)?;
        let url = map
            .get_first(&["ServiceUri", "Service Uri", "Url", "Server"])
            .ok_or_else(|| ConnectionError::configuration("connection string has no Url"))?
            .to_string();

        match map.get("AuthType").unwrap_or("AD") {
            "ClientSecret" => {
                let client_id = map.get("ClientId").ok_or_else(|| {
                    ConnectionError::configuration("connection string has no ClientId")
                })?;
                let secret = map.get("ClientSecret").ok_or_else(|| {
                    ConnectionError::configuration("connection string has no ClientSecret")
                })?;
                let http = Self::http_client(timeout)?;
                let token = Self::acquire_token(
                    &http,
                    &[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id),
                        ("client_secret", secret),
                        ("resource", &url),
                    ],
                )
                .await?;
                self.connect(&url, token, AuthMechanism::ClientSecret, timeout)
                    .await
            }
            auth_type @ ("OAuth" | "Office365") => {
                let user_name = map.get("Username").unwrap_or_default();
                let password = map.get("Password").unwrap_or_default();
                let client_id = map
                    .get("ClientId")
                    .unwrap_or(constants::DEFAULT_APP_ID);
                let mechanism = if auth_type == "Office365" {
                    AuthMechanism::Office365
                } else {
                    AuthMechanism::OAuth
                };
                let http = Self::http_client(timeout)?;
                let token = Self::acquire_token(
                    &http,
                    &[
                        ("grant_type", "password"),
                        ("client_id", client_id),
                        ("username", user_name),
                        ("password", password),
                        ("resource", &url),
                    ],
                )
                .await?;
                self.connect(&url, token, mechanism, timeout).await
            }
            other => Err(ConnectionError::session(format!(
                "AuthType={other} is not supported by the built-in Web API client"
            ))),
        }
    }

    async fn interactive(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let Some(hook) = current_auth_override() else {
            return Err(ConnectionError::session(
                "interactive sign-in requires an auth override; none is installed",
            ));
        };
        let token = hook.acquire_token(url).await?;
        self.connect(url, token, AuthMechanism::OAuth, timeout).await
    }

    async fn with_client_secret(
        &self,
        url: &str,
        app_id: Uuid,
        client_secret: &str,
        _token_cache_path: PathBuf,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let http = Self::http_client(timeout)?;
        let token = Self::acquire_token(
            &http,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", &app_id.to_string()),
                ("client_secret", client_secret),
                ("resource", url),
            ],
        )
        .await?;
        self.connect(url, token, AuthMechanism::ClientSecret, timeout)
            .await
    }

    async fn online(
        &self,
        params: OnlineParams,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        let http = Self::http_client(timeout)?;
        let token = Self::acquire_token(
            &http,
            &[
                ("grant_type", "password"),
                ("client_id", &params.app_id.to_string()),
                ("username", &params.user_name),
                ("password", &params.password),
                ("resource", &params.url),
            ],
        )
        .await?;
        self.connect(&params.url, token, AuthMechanism::Office365, timeout)
            .await
    }

    async fn with_network_credentials(
        &self,
        params: OnPremParams,
        _timeout: Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        Err(ConnectionError::session(format!(
            "integrated authentication against {} is not supported by the built-in Web API client",
            params.server_name
        )))
    }
}

/// Live Web API session: a bearer token, a pooled HTTP client, and the
/// organization facts gathered at connect time.
#[derive(Debug)]
pub struct WebApiSession {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    mechanism: AuthMechanism,
    ready: bool,
    last_error: Option<String>,
    caller_id: Mutex<Option<Uuid>>,
    organization: OrganizationInfo,
    endpoints: OrganizationEndpoints,
}

impl WebApiSession {
    /// Verifies the token against the organization and gathers its identity.
    /// Failures produce a not-ready session carrying the error, not an `Err`.
    async fn connect(
        http: reqwest::Client,
        base_url: &str,
        access_token: String,
        mechanism: AuthMechanism,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let mut session = Self {
            http,
            base_url: base_url.clone(),
            access_token,
            mechanism,
            ready: false,
            last_error: None,
            caller_id: Mutex::new(None),
            organization: OrganizationInfo::default(),
            endpoints: OrganizationEndpoints {
                organization_service: format!("{base_url}/XRMServices/2011/Organization.svc"),
                organization_data_service: format!("{base_url}{}", constants::api_path()),
                web_application: base_url.clone(),
            },
        };

        match session.initialize().await {
            Ok(()) => {
                session.ready = true;
                info!(
                    "connected to {} (version {})",
                    session.organization.unique_name, session.organization.version
                );
            }
            Err(error) => {
                session.last_error = Some(error.to_string());
            }
        }
        session
    }

    async fn initialize(&mut self) -> Result<(), ServiceFault> {
        // WhoAmI both validates the token and proves the endpoint is alive.
        let who_am_i = self.get_function("WhoAmI").await?;
        let version = self.get_function("RetrieveVersion").await?;

        let unique_name = crate::api::models::host_of(&self.base_url)
            .and_then(|host| host.split('.').next())
            .unwrap_or_default()
            .to_string();

        self.organization = OrganizationInfo {
            friendly_name: unique_name.clone(),
            unique_name,
            url_name: None,
            version: version
                .get("Version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tenant_id: None,
            environment_id: who_am_i
                .get("OrganizationId")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        Ok(())
    }

    async fn get_function(&self, function: &str) -> Result<Value, ServiceFault> {
        let url = format!("{}{}/{function}", self.base_url, constants::api_path());
        self.get_json(&url).await
    }

    async fn get_json(&self, url: &str) -> Result<Value, ServiceFault> {
        let mut request = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Accept", "application/json")
            .header("OData-MaxVersion", headers::ODATA_VERSION)
            .header("OData-Version", headers::ODATA_VERSION);

        if let Some(caller) = *self.caller_id.lock().unwrap() {
            request = request.header(headers::CALLER_ID, caller.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|error| ServiceFault::new(0, format!("request failed: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| ServiceFault::new(0, format!("failed to read response: {error}")))?;

        if !status.is_success() {
            return Err(parse_fault(status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|error| ServiceFault::new(0, format!("malformed response body: {error}")))
    }
}

#[async_trait]
impl Session for WebApiSession {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn auth_mechanism(&self) -> AuthMechanism {
        self.mechanism
    }

    fn endpoints(&self) -> OrganizationEndpoints {
        self.endpoints.clone()
    }

    fn organization(&self) -> OrganizationInfo {
        self.organization.clone()
    }

    fn set_caller_id(&self, caller: Option<Uuid>) {
        *self.caller_id.lock().unwrap() = caller;
    }

    async fn fetch(&self, fetch_xml: &str) -> Result<Vec<Value>, ServiceFault> {
        let entity = fetch_entity_name(fetch_xml)?;
        let entity_set = entity_set_name(&entity);
        let url = format!(
            "{}?fetchXml={}",
            constants::entity_endpoint(&self.base_url, &entity_set),
            urlencoding::encode(fetch_xml),
        );

        debug!("executing FetchXML query against {entity_set}");
        let body = self.get_json(&url).await?;
        Ok(body
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn retrieve_metadata_changes(
        &self,
        client_version_stamp: Option<&str>,
    ) -> Result<MetadataChanges, ServiceFault> {
        let url = match client_version_stamp {
            Some(stamp) => format!(
                "{}{}/RetrieveMetadataChanges(ClientVersionStamp=@p1)?@p1='{}'",
                self.base_url,
                constants::api_path(),
                urlencoding::encode(stamp),
            ),
            None => format!(
                "{}{}/RetrieveMetadataChanges",
                self.base_url,
                constants::api_path()
            ),
        };

        debug!(
            "retrieving metadata changes (incremental: {})",
            client_version_stamp.is_some()
        );
        let body = self.get_json(&url).await?;
        Ok(parse_metadata_changes(&body))
    }

    async fn clone_session(&self) -> Result<Arc<dyn Session>, ServiceFault> {
        Ok(Arc::new(Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            access_token: self.access_token.clone(),
            mechanism: self.mechanism,
            ready: self.ready,
            last_error: self.last_error.clone(),
            caller_id: Mutex::new(None),
            organization: self.organization.clone(),
            endpoints: self.endpoints.clone(),
        }))
    }
}

/// Exchanges a stored refresh token for access tokens when installed as the
/// process auth override.
pub struct RefreshTokenOverride {
    http: reqwest::Client,
    refresh_token: String,
    app_id: Uuid,
}

impl RefreshTokenOverride {
    pub fn new(refresh_token: String, app_id: Uuid) -> Self {
        Self {
            http: reqwest::Client::new(),
            refresh_token,
            app_id,
        }
    }
}

#[async_trait]
impl AuthOverride for RefreshTokenOverride {
    async fn acquire_token(&self, resource: &str) -> Result<String, ConnectionError> {
        WebApiFactory::acquire_token(
            &self.http,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", &self.app_id.to_string()),
                ("refresh_token", &self.refresh_token),
                ("resource", resource),
            ],
        )
        .await
    }
}

/// Entity logical name of a FetchXML document.
fn fetch_entity_name(fetch_xml: &str) -> Result<String, ServiceFault> {
    let document = roxmltree::Document::parse(fetch_xml)
        .map_err(|error| ServiceFault::new(0, format!("failed to parse FetchXML: {error}")))?;
    let entity = document
        .descendants()
        .find(|node| node.has_tag_name("entity"))
        .and_then(|node| node.attribute("name"))
        .ok_or_else(|| ServiceFault::new(0, "FetchXML has no entity element"))?;
    Ok(entity.to_string())
}

/// Entity set (plural) name for a logical name. Covers the irregular built-ins
/// and falls back to appending `s`.
fn entity_set_name(logical_name: &str) -> String {
    match logical_name {
        "opportunity" => "opportunities".to_string(),
        "activitypointer" => "activitypointers".to_string(),
        "systemuserroles" => "systemuserrolescollection".to_string(),
        "fax" => "faxes".to_string(),
        name if name.ends_with('y') => format!("{}ies", &name[..name.len() - 1]),
        name if name.ends_with('s') => format!("{name}es"),
        name => format!("{name}s"),
    }
}

/// Maps an error response body onto a typed fault, recognizing the hex error
/// codes the organization service reports.
fn parse_fault(status: u16, body: &str) -> ServiceFault {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(error) = parsed.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .and_then(parse_error_code)
                .unwrap_or(u32::from(status));
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("organization service error")
                .to_string();
            return ServiceFault::new(code, message);
        }
    }
    ServiceFault::new(u32::from(status), body.to_string())
}

fn parse_error_code(code: &str) -> Option<u32> {
    let trimmed = code.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16)
        .ok()
        .or_else(|| code.parse().ok())
}

fn parse_metadata_changes(body: &Value) -> MetadataChanges {
    let entities = body
        .get("EntityMetadata")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(parse_entity_descriptor).collect())
        .unwrap_or_default();

    MetadataChanges {
        entities,
        server_version_stamp: body
            .get("ServerVersionStamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_entity_descriptor(entity: &Value) -> EntityDescriptor {
    EntityDescriptor {
        logical_name: string_field(entity, "LogicalName"),
        schema_name: optional_string_field(entity, "SchemaName"),
        entity_set_name: optional_string_field(entity, "EntitySetName"),
        display_name: entity
            .pointer("/DisplayName/UserLocalizedLabel/Label")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_custom: entity
            .get("IsCustomEntity")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        attributes: entity
            .get("Attributes")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(parse_attribute_descriptor).collect())
            .unwrap_or_default(),
    }
}

fn parse_attribute_descriptor(attribute: &Value) -> AttributeDescriptor {
    let required = attribute
        .pointer("/RequiredLevel/Value")
        .and_then(Value::as_str)
        .map(|level| level == "ApplicationRequired" || level == "SystemRequired")
        .unwrap_or(false);

    AttributeDescriptor {
        logical_name: string_field(attribute, "LogicalName"),
        attribute_type: optional_string_field(attribute, "AttributeType"),
        is_required: required,
        is_custom: attribute
            .get("IsCustomAttribute")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_name_is_read_from_fetchxml() {
        let xml = r#"<fetch><entity name="account"><attribute name="name"/></entity></fetch>"#;
        assert_eq!(fetch_entity_name(xml).unwrap(), "account");
        assert!(fetch_entity_name("<not-fetch/>").is_err());
        assert!(fetch_entity_name("not xml").is_err());
    }

    #[test]
    fn entity_sets_cover_irregular_plurals() {
        assert_eq!(entity_set_name("account"), "accounts");
        assert_eq!(entity_set_name("opportunity"), "opportunities");
        assert_eq!(entity_set_name("systemuserroles"), "systemuserrolescollection");
        assert_eq!(entity_set_name("fax"), "faxes");
    }

    #[test]
    fn fault_codes_parse_from_hex() {
        let body = json!({
            "error": {"code": "0x80044352", "message": "Version stamp associated with the client has expired."}
        })
        .to_string();
        let fault = parse_fault(400, &body);
        assert_eq!(fault.code, 0x8004_4352);
        assert!(fault.message.contains("expired"));
    }

    #[test]
    fn fault_falls_back_to_http_status() {
        let fault = parse_fault(503, "service unavailable");
        assert_eq!(fault.code, 503);
    }

    #[test]
    fn metadata_changes_parse_entities_and_stamp() {
        let body = json!({
            "ServerVersionStamp": "stamp-42",
            "EntityMetadata": [{
                "LogicalName": "account",
                "SchemaName": "Account",
                "EntitySetName": "accounts",
                "IsCustomEntity": false,
                "DisplayName": {"UserLocalizedLabel": {"Label": "Account"}},
                "Attributes": [{
                    "LogicalName": "name",
                    "AttributeType": "String",
                    "RequiredLevel": {"Value": "ApplicationRequired"},
                    "IsCustomAttribute": false
                }]
            }]
        });

        let changes = parse_metadata_changes(&body);
        assert_eq!(changes.server_version_stamp, "stamp-42");
        assert_eq!(changes.entities.len(), 1);

        let account = &changes.entities[0];
        assert_eq!(account.logical_name, "account");
        assert_eq!(account.display_name.as_deref(), Some("Account"));
        assert_eq!(account.attributes.len(), 1);
        assert!(account.attributes[0].is_required);
    }
}
