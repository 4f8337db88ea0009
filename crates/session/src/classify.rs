//! Provider error classification
//!
//! Maps provider error codes onto the handful of conditions the session state
//! machine reacts to. Anything unrecognized is `Other` and propagates as-is.

use identity::{ProviderError, codes};

/// What a provider failure means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A previous interaction never completed; run stuck-interaction recovery
    InteractionInProgress,
    /// The provider needs the user to sign in interactively
    InteractionRequired,
    /// The user closed or declined the sign-in
    UserCancelled,
    /// The sign-in window could not be opened
    PopupBlocked,
    /// No special handling
    Other,
}

const INTERACTION_IN_PROGRESS_CODES: &[&str] = &[codes::INTERACTION_IN_PROGRESS];

const INTERACTION_REQUIRED_CODES: &[&str] = &[
    codes::INTERACTION_REQUIRED,
    codes::LOGIN_REQUIRED,
    codes::CONSENT_REQUIRED,
    codes::INVALID_GRANT,
    codes::NO_ACCOUNT,
];

const USER_CANCELLED_CODES: &[&str] = &[codes::USER_CANCELLED, "access_denied"];

const POPUP_BLOCKED_CODES: &[&str] = &[codes::POPUP_BLOCKED, "empty_window_error"];

/// Classify a provider error by its code (case-insensitive).
pub fn classify(err: &ProviderError) -> Classification {
    let code = err.code();
    let matches = |table: &[&str]| table.iter().any(|c| c.eq_ignore_ascii_case(code));

    if matches(INTERACTION_IN_PROGRESS_CODES) {
        Classification::InteractionInProgress
    } else if matches(INTERACTION_REQUIRED_CODES) {
        Classification::InteractionRequired
    } else if matches(USER_CANCELLED_CODES) {
        Classification::UserCancelled
    } else if matches(POPUP_BLOCKED_CODES) {
        Classification::PopupBlocked
    } else {
        Classification::Other
    }
}
