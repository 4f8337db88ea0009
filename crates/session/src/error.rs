//! Session error taxonomy
//!
//! Provider error codes never leave this crate unclassified except through
//! `Error::Provider`, which carries failures the session has no recovery for.

use identity::{ProviderError, StorageError};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session manager is not initialized")]
    NotInitialized,

    #[error("no signed-in account")]
    NoAccount,

    #[error("interactive login required: {0}")]
    InteractionRequired(String),

    #[error("silent token renewal failed: {0}")]
    SilentRefreshFailed(String),

    #[error("another sign-in interaction is in progress, retry shortly: {0}")]
    InteractionInProgress(String),

    #[error("an interactive login is already in progress")]
    LoginAlreadyInProgress,

    #[error("the login window was closed or interrupted, please try again")]
    InteractionInterrupted,

    #[error("login was cancelled, please try again")]
    UserCancelled,

    #[error("the login popup was blocked, allow popups and try again")]
    PopupBlocked,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Error {
    /// Resolved by the user signing in (again).
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Error::NoAccount
                | Error::InteractionRequired(_)
                | Error::SilentRefreshFailed(_)
                | Error::InteractionInterrupted
                | Error::UserCancelled
                | Error::PopupBlocked
        )
    }

    /// Worth retrying the same action after a short wait.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::InteractionInProgress(_)
                | Error::InteractionInterrupted
                | Error::UserCancelled
                | Error::PopupBlocked
        )
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages() {
        assert_eq!(
            Error::LoginAlreadyInProgress.to_string(),
            "an interactive login is already in progress"
        );
        assert_eq!(
            Error::UserCancelled.to_string(),
            "login was cancelled, please try again"
        );
        assert!(
            Error::InteractionInterrupted
                .to_string()
                .contains("closed or interrupted")
        );
    }

    #[test]
    fn provider_errors_pass_through_unchanged() {
        let err: Error = ProviderError::new("server_error", "token endpoint returned 500").into();
        assert_eq!(err.to_string(), "server_error: token endpoint returned 500");
        assert!(!err.requires_login());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_versus_login_split() {
        assert!(Error::NoAccount.requires_login());
        assert!(!Error::NoAccount.is_retryable());
        assert!(Error::InteractionInProgress("stuck".into()).is_retryable());
        assert!(!Error::LoginAlreadyInProgress.is_retryable());
        assert!(!Error::NotInitialized.requires_login());
    }
}
