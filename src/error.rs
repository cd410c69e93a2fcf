use thiserror::Error;

/// Typed fault reported by the organization service.
///
/// Carries the numeric error code so callers can recognize recoverable
/// conditions such as an expired metadata version stamp.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("organization service fault 0x{code:08x}: {message}")]
pub struct ServiceFault {
    pub code: u32,
    pub message: String,
}

impl ServiceFault {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors produced while resolving connections or synchronizing metadata.
///
/// The enum is `Clone` so the outcome of a shared background refresh can be
/// handed to every caller awaiting the same operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The profile is missing fields required by its authentication kind, or
    /// targets an unsupported server version. Fatal; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Session construction failed or the session reported not-ready. The
    /// failed session is discarded; callers may retry with a forced new session.
    #[error("session error: {0}")]
    Session(String),

    /// A fault the organization service reported and the crate did not recover.
    #[error(transparent)]
    ServiceFault(#[from] ServiceFault),
}

impl ConnectionError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
