//! Well-known constants for the Dynamics 365 Web API and first-party OAuth apps.

use std::time::Duration;

/// Dynamics 365 Web API version
pub const API_VERSION: &str = "v9.2";

/// Base API path for Dynamics 365
pub const API_BASE_PATH: &str = "/api/data";

/// Full API path with version
pub fn api_path() -> String {
    format!("{}/{}", API_BASE_PATH, API_VERSION)
}

/// Azure AD token endpoint used by the built-in OAuth flows
pub const TOKEN_ENDPOINT: &str = "https://login.windows.net/common/oauth2/token";

/// Public first-party application id used when a profile carries none
pub const DEFAULT_APP_ID: &str = "51f81489-12ee-4a9e-aaae-a2591f45987d";

/// Public first-party reply URL used when a profile carries none
pub const DEFAULT_REPLY_URL: &str = "app://58145B91-0C36-4500-8554-080854F2AC97";

/// Hostname suffix identifying hosted online organizations
pub const ONLINE_DOMAIN_SUFFIX: &str = ".dynamics.com";

/// Fault code returned when the supplied metadata version stamp is too old to
/// serve an incremental response
pub const FAULT_VERSION_STAMP_EXPIRED: u32 = 0x8004_4352;

/// Oldest organization major version that supports incremental metadata queries
pub const MIN_METADATA_MAJOR_VERSION: u32 = 8;

/// Request timeout applied when a profile does not set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Standard headers for Dynamics 365 requests
pub mod headers {
    /// OData version header
    pub const ODATA_VERSION: &str = "4.0";

    /// Impersonation header carrying the caller id
    pub const CALLER_ID: &str = "MSCRMCallerID";
}

/// Build full entity endpoint URL
pub fn entity_endpoint(base_url: &str, entity: &str) -> String {
    format!("{}{}/{}", base_url.trim_end_matches('/'), api_path(), entity)
}
