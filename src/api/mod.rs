//! Connection profiles and metadata synchronization for the Dynamics 365 Web API.
//!
//! The three pillars are [`auth::AuthResolver`] (profile -> live session),
//! [`impersonation::ImpersonationProbe`] (one capability query per session),
//! and [`metadata::MetadataCacheManager`] (disk-backed, single-flight schema
//! cache). [`client`] supplies a reqwest-backed default transport; everything
//! else talks to the [`session`] traits so other transports can be dropped in.

pub mod auth;
pub mod client;
pub mod connection_string;
pub mod constants;
pub mod impersonation;
pub mod metadata;
pub mod models;
pub mod session;

pub use auth::{AuthResolver, AuthStrategy, STRATEGY_ORDER, select_strategy};
pub use client::{RefreshTokenOverride, WebApiFactory, WebApiSession};
pub use connection_string::ConnectionStringMap;
pub use impersonation::ImpersonationProbe;
pub use metadata::{
    AttributeDescriptor, EntityDescriptor, METADATA_FORMAT_VERSION, MetadataCacheManager,
    MetadataRefresh, MetadataSnapshot,
};
pub use models::{AuthKind, CertificateRef, ConnectionProfile};
pub use session::{
    AuthMechanism, AuthOverride, AuthOverrideGuard, MetadataChanges, NetworkCredentials,
    OnPremKind, OnPremParams, OnlineParams, OrganizationEndpoints, OrganizationInfo, Session,
    SessionFactory, current_auth_override, install_auth_override,
};
