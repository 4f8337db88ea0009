//! Observable session state
//!
//! `SessionState` is the snapshot UI adapters render. It is derived from the
//! manager's internal `Lifecycle` plus the token cache and published on a
//! `tokio::sync::watch` channel after every transition.

use common::Secret;
use identity::{FlowType, ProviderIdentity};
use serde::Serialize;

/// Coarse lifecycle phase.
///
/// Transitions:
/// - Uninitialized → Initializing (`initialize`)
/// - Initializing → AuthenticatedFresh (silent acquisition or redirect resume)
/// - Initializing → NeedsLogin (no account, or silent acquisition failed)
/// - Initializing → Error (provider could not be constructed)
/// - AuthenticatedFresh → AuthenticatedStale (token passed its effective expiry)
/// - AuthenticatedStale → AuthenticatedFresh (renewal succeeded)
/// - any authenticated phase → NeedsLogin (logout, account gone, login failed)
/// - any phase → Uninitialized (`clear_authentication_state`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Initializing,
    AuthenticatedFresh,
    AuthenticatedStale,
    NeedsLogin,
    Error,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initializing => "initializing",
            Phase::AuthenticatedFresh => "authenticated_fresh",
            Phase::AuthenticatedStale => "authenticated_stale",
            Phase::NeedsLogin => "needs_login",
            Phase::Error => "error",
        }
    }
}

/// What adapters observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub initializing: bool,
    pub authenticated: bool,
    pub needs_login: bool,
    pub error: Option<String>,
    /// Current fresh bearer token, if any
    pub token: Option<Secret<String>>,
    pub is_embedded_context: bool,
}

impl SessionState {
    /// JSON view for adapters. The bearer itself is never included.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "initializing": self.initializing,
            "authenticated": self.authenticated,
            "needs_login": self.needs_login,
            "error": self.error,
            "has_token": self.token.is_some(),
            "is_embedded_context": self.is_embedded_context,
        })
    }
}

/// Diagnostic status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub initialized: bool,
    pub has_token: bool,
    /// Effective expiry of the cached token (unix millis)
    pub token_expiry: Option<u64>,
    pub login_in_progress: bool,
    pub account_count: usize,
    pub flow: Option<FlowType>,
    /// Period of the armed renewal timer, if one is running
    pub renewal_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Internal lifecycle record guarded by the manager.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    pub stage: Stage,
    pub identity: Option<ProviderIdentity>,
    pub authenticated: bool,
    pub needs_login: bool,
    pub error: Option<String>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stage: Stage::Uninitialized,
            identity: None,
            authenticated: false,
            needs_login: false,
            error: None,
        }
    }

    pub fn phase(&self, has_fresh_token: bool) -> Phase {
        match self.stage {
            Stage::Uninitialized => Phase::Uninitialized,
            Stage::Initializing => Phase::Initializing,
            Stage::Failed => Phase::Error,
            Stage::Ready if !self.authenticated => Phase::NeedsLogin,
            Stage::Ready if has_fresh_token => Phase::AuthenticatedFresh,
            Stage::Ready => Phase::AuthenticatedStale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_follows_stage_and_token() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.phase(false), Phase::Uninitialized);

        lc.stage = Stage::Initializing;
        assert_eq!(lc.phase(true), Phase::Initializing);

        lc.stage = Stage::Ready;
        assert_eq!(lc.phase(true), Phase::NeedsLogin);

        lc.authenticated = true;
        assert_eq!(lc.phase(true), Phase::AuthenticatedFresh);
        assert_eq!(lc.phase(false), Phase::AuthenticatedStale);

        lc.stage = Stage::Failed;
        assert_eq!(lc.phase(true), Phase::Error);
    }

    #[test]
    fn json_view_hides_bearer() {
        let state = SessionState {
            authenticated: true,
            token: Some(Secret::new("at_secret".into())),
            ..Default::default()
        };
        let json = state.to_json();
        assert_eq!(json["has_token"], true);
        assert_eq!(json["authenticated"], true);
        assert!(!json.to_string().contains("at_secret"));
    }

    #[test]
    fn status_serializes_phase_label() {
        let status = StatusSnapshot {
            phase: Phase::AuthenticatedFresh,
            initialized: true,
            has_token: true,
            token_expiry: Some(1),
            login_in_progress: false,
            account_count: 1,
            flow: Some(FlowType::Popup),
            renewal_interval_secs: Some(1800),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], Phase::AuthenticatedFresh.label());
        assert_eq!(json["flow"], "popup");
    }
}
