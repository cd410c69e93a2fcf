//! Shared mock session and factory for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use dynamics_connection::api::session::{
    AuthMechanism, MetadataChanges, OnPremParams, OnlineParams, OrganizationEndpoints,
    OrganizationInfo, Session, SessionFactory, current_auth_override,
};
use dynamics_connection::api::{ConnectionProfile, EntityDescriptor};
use dynamics_connection::error::{ConnectionError, ServiceFault};
use dynamics_connection::secret::{KeyMaterial, SecretVault};

/// Serializes tests that touch the process-wide auth override.
pub fn override_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub fn test_vault() -> SecretVault {
    SecretVault::new(KeyMaterial {
        passphrase: "integration tests".into(),
        salt: "salt".into(),
        iterations: 32,
        init_vector: "iv".into(),
        ..Default::default()
    })
}

pub fn default_changes(stamp: &str) -> MetadataChanges {
    MetadataChanges {
        entities: vec![
            EntityDescriptor {
                logical_name: "account".into(),
                ..Default::default()
            },
            EntityDescriptor {
                logical_name: "contact".into(),
                ..Default::default()
            },
        ],
        server_version_stamp: stamp.into(),
    }
}

/// Counters and scripted behavior shared between a session and its clones.
#[derive(Debug, Default)]
pub struct MockState {
    pub fetch_calls: AtomicUsize,
    pub fetch_rows: Mutex<Vec<Value>>,
    pub fetch_fault: Mutex<Option<ServiceFault>>,
    pub metadata_calls: AtomicUsize,
    /// Version stamps received, in call order.
    pub metadata_stamps: Mutex<Vec<Option<String>>>,
    /// Responses consumed in order; when exhausted, a full default response is
    /// served.
    pub metadata_script: Mutex<VecDeque<Result<MetadataChanges, ServiceFault>>>,
    pub default_stamp: Mutex<String>,
    pub clone_calls: AtomicUsize,
    pub caller: Mutex<Option<Uuid>>,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
}

#[derive(Debug)]
pub struct MockSession {
    ready: bool,
    last_error: Option<String>,
    mechanism: AuthMechanism,
    organization: OrganizationInfo,
    endpoints: OrganizationEndpoints,
    pub state: Arc<MockState>,
}

impl MockSession {
    pub fn ready() -> Self {
        let state = MockState {
            default_stamp: Mutex::new("stamp-1".into()),
            ..Default::default()
        };
        Self {
            ready: true,
            last_error: None,
            mechanism: AuthMechanism::Office365,
            organization: OrganizationInfo {
                unique_name: "contoso".into(),
                friendly_name: "Contoso".into(),
                url_name: Some("contoso".into()),
                version: "9.2.24104.177".into(),
                tenant_id: Some(Uuid::new_v4()),
                environment_id: Some("env-0001".into()),
            },
            endpoints: OrganizationEndpoints {
                organization_service: "https://contoso.crm.dynamics.com/XRMServices/2011/Organization.svc"
                    .into(),
                organization_data_service: "https://contoso.crm.dynamics.com/api/data/v9.2".into(),
                web_application: "https://contoso.crm.dynamics.com".into(),
            },
            state: Arc::new(state),
        }
    }

    pub fn not_ready(error: &str) -> Self {
        let mut session = Self::ready();
        session.ready = false;
        session.last_error = Some(error.to_string());
        session
    }

    pub fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn with_fetch_rows(self, rows: Vec<Value>) -> Self {
        *self.state.fetch_rows.lock().unwrap() = rows;
        self
    }

    pub fn with_fetch_fault(self, fault: ServiceFault) -> Self {
        *self.state.fetch_fault.lock().unwrap() = Some(fault);
        self
    }

    pub fn script_metadata(self, result: Result<MetadataChanges, ServiceFault>) -> Self {
        self.state.metadata_script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_default_stamp(self, stamp: &str) -> Self {
        *self.state.default_stamp.lock().unwrap() = stamp.to_string();
        self
    }

    /// Makes every metadata call wait for one permit from the returned gate.
    pub fn gated(self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.gate.lock().unwrap() = Some(Arc::clone(&gate));
        (self, gate)
    }

    fn clone_instance(&self) -> Self {
        Self {
            ready: self.ready,
            last_error: self.last_error.clone(),
            mechanism: self.mechanism,
            organization: self.organization.clone(),
            endpoints: self.endpoints.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Session for MockSession {
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
        *self.state.caller.lock().unwrap() = caller;
    }

    async fn fetch(&self, _fetch_xml: &str) -> Result<Vec<Value>, ServiceFault> {
        self.state.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.state.fetch_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        Ok(self.state.fetch_rows.lock().unwrap().clone())
    }

    async fn retrieve_metadata_changes(
        &self,
        client_version_stamp: Option<&str>,
    ) -> Result<MetadataChanges, ServiceFault> {
        let gate = self.state.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.state.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .metadata_stamps
            .lock()
            .unwrap()
            .push(client_version_stamp.map(str::to_string));

        let scripted = self.state.metadata_script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(default_changes(&self.state.default_stamp.lock().unwrap())),
        }
    }

    async fn clone_session(&self) -> Result<Arc<dyn Session>, ServiceFault> {
        self.state.clone_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone_instance()))
    }
}

/// Factory call record, human-readable for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryCall {
    ConnectionString { value: String },
    Interactive { url: String, override_installed: bool },
    ClientSecret { url: String, app_id: Uuid, secret: String },
    Online { url: String, user_name: String },
    OnPrem { server: String, custom: bool, ifd: bool },
}

#[derive(Default)]
pub struct MockFactory {
    pub calls: Mutex<Vec<FactoryCall>>,
    sessions: Mutex<VecDeque<Arc<MockSession>>>,
    fail_with: Mutex<Option<ConnectionError>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a session to hand out; when the queue is empty a default ready
    /// session is built.
    pub fn with_session(self, session: MockSession) -> Self {
        self.sessions.lock().unwrap().push_back(Arc::new(session));
        self
    }

    /// Makes every build attempt fail.
    pub fn failing_with(self, error: ConnectionError) -> Self {
        *self.fail_with.lock().unwrap() = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<FactoryCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_session(&self) -> Result<Arc<dyn Session>, ConnectionError> {
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(MockSession::ready()));
        Ok(session)
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn from_connection_string(
        &self,
        connection_string: &str,
        _timeout: std::time::Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        self.calls.lock().unwrap().push(FactoryCall::ConnectionString {
            value: connection_string.to_string(),
        });
        self.next_session()
    }

    async fn interactive(
        &self,
        url: &str,
        _timeout: std::time::Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        self.calls.lock().unwrap().push(FactoryCall::Interactive {
            url: url.to_string(),
            override_installed: current_auth_override().is_some(),
        });
        self.next_session()
    }

    async fn with_client_secret(
        &self,
        url: &str,
        app_id: Uuid,
        client_secret: &str,
        _token_cache_path: std::path::PathBuf,
        _timeout: std::time::Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        self.calls.lock().unwrap().push(FactoryCall::ClientSecret {
            url: url.to_string(),
            app_id,
            secret: client_secret.to_string(),
        });
        self.next_session()
    }

    async fn online(
        &self,
        params: OnlineParams,
        _timeout: std::time::Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        self.calls.lock().unwrap().push(FactoryCall::Online {
            url: params.url,
            user_name: params.user_name,
        });
        self.next_session()
    }

    async fn with_network_credentials(
        &self,
        params: OnPremParams,
        _timeout: std::time::Duration,
    ) -> Result<Arc<dyn Session>, ConnectionError> {
        self.calls.lock().unwrap().push(FactoryCall::OnPrem {
            server: params.server_name,
            custom: params.credentials.is_some(),
            ifd: params.kind == dynamics_connection::api::session::OnPremKind::Ifd,
        });
        self.next_session()
    }
}

/// Profile already holding a live session, ready for metadata refreshes.
pub fn connected_profile(session: MockSession) -> ConnectionProfile {
    let mut profile = ConnectionProfile::new("integration");
    profile.original_url = "https://contoso.crm.dynamics.com".into();
    profile.organization_version = Some("9.2.24104.177".into());
    profile.attach_session(Arc::new(session));
    profile
}
