use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CirrusError {
    // Provider taxonomy
    #[error("Authorization error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider rejected the request: {0}")]
    Provider(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Precondition failed: {0}")]
    Precondition(String),

    // IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found at {0}, run `cirrus init` first")]
    ConfigNotFound(String),

    #[error("Invalid provider id: {0}")]
    InvalidProviderId(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

pub type Result<T> = std::result::Result<T, CirrusError>;

/// Coarse classification shared by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Session invalid or expired. Re-authenticate, do not retry.
    Auth,
    /// Transient transport failure. Retry with backoff.
    Network,
    /// Rejected for a reason intrinsic to the request.
    Provider,
    NotFound,
    Cancelled,
    Precondition,
    /// Local failures outside the provider taxonomy (io, config).
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Provider => write!(f, "provider"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Precondition => write!(f, "precondition"),
            ErrorKind::Local => write!(f, "local"),
        }
    }
}

impl CirrusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CirrusError::Auth(_) => ErrorKind::Auth,
            CirrusError::Network(_) => ErrorKind::Network,
            CirrusError::Provider(_) => ErrorKind::Provider,
            CirrusError::NotFound(_) => ErrorKind::NotFound,
            CirrusError::Cancelled => ErrorKind::Cancelled,
            CirrusError::Precondition(_) => ErrorKind::Precondition,
            _ => ErrorKind::Local,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    /// Only network failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }
}

/// Cloneable snapshot of an error, used where the value has to be observed
/// by more than one reader (transfer states, shared completions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&CirrusError> for Failure {
    fn from(err: &CirrusError) -> Self {
        let message = match err {
            CirrusError::Auth(m)
            | CirrusError::Network(m)
            | CirrusError::Provider(m)
            | CirrusError::NotFound(m)
            | CirrusError::Precondition(m) => m.clone(),
            other => other.to_string(),
        };
        Failure::new(err.kind(), message)
    }
}

impl From<CirrusError> for Failure {
    fn from(err: CirrusError) -> Self {
        Failure::from(&err)
    }
}

impl From<Failure> for CirrusError {
    fn from(f: Failure) -> Self {
        match f.kind {
            ErrorKind::Auth => CirrusError::Auth(f.message),
            ErrorKind::Network => CirrusError::Network(f.message),
            ErrorKind::Provider => CirrusError::Provider(f.message),
            ErrorKind::NotFound => CirrusError::NotFound(f.message),
            ErrorKind::Cancelled => CirrusError::Cancelled,
            ErrorKind::Precondition => CirrusError::Precondition(f.message),
            ErrorKind::Local => CirrusError::Io(std::io::Error::other(f.message)),
        }
    }
}
