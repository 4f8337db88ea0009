//! Error types for identity provider and storage operations

/// Well-known protocol error codes carried by `ProviderError`.
///
/// OAuth token-endpoint errors (`invalid_grant`, `interaction_required`, ...)
/// are passed through verbatim; the remaining codes are produced locally.
pub mod codes {
    pub const INTERACTION_IN_PROGRESS: &str = "interaction_in_progress";
    pub const INTERACTION_REQUIRED: &str = "interaction_required";
    pub const LOGIN_REQUIRED: &str = "login_required";
    pub const CONSENT_REQUIRED: &str = "consent_required";
    pub const INVALID_GRANT: &str = "invalid_grant";
    pub const USER_CANCELLED: &str = "user_cancelled";
    pub const POPUP_BLOCKED: &str = "popup_window_error";
    pub const NO_ACCOUNT: &str = "no_account_error";
    pub const STATE_MISMATCH: &str = "state_mismatch";
    pub const UNINITIALIZED: &str = "uninitialized_provider";
    pub const INVALID_CONFIG: &str = "invalid_config";
    pub const NETWORK: &str = "network_error";
    pub const SERVER: &str = "server_error";
    pub const INVALID_RESPONSE: &str = "invalid_response";
    pub const STORAGE: &str = "storage_error";
}

/// Failure reported by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct ProviderError {
    pub code: String,
    pub description: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl From<StorageError> for ProviderError {
    fn from(err: StorageError) -> Self {
        ProviderError::new(codes::STORAGE, err.to_string())
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors from the key/value storage tiers.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("storage parse error: {0}")]
    Parse(String),
}
