//! Shared provider types
//!
//! Timestamps are unix milliseconds (absolute), matching what the token
//! endpoint's `expires_in` delta is converted to at acquisition time.

use common::Secret;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// How interactive sign-in and sign-out are presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    /// Separate window; the caller's task resumes with the result
    #[default]
    Popup,
    /// Full navigation away; the result is picked up on the next start
    Redirect,
}

impl FlowType {
    pub fn label(&self) -> &'static str {
        match self {
            FlowType::Popup => "popup",
            FlowType::Redirect => "redirect",
        }
    }
}

/// Which storage tier holds account records and the session's token cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Per-tab: gone when the host process exits
    #[default]
    Ephemeral,
    /// Per-origin: survives restarts
    Durable,
}

/// OIDC `prompt` parameter sent with interactive requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    #[default]
    SelectAccount,
    Login,
    Consent,
    None,
}

impl Prompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prompt::SelectAccount => "select_account",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
            Prompt::None => "none",
        }
    }
}

/// A signed-in account as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
        }
    }
}

/// Successful token acquisition.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub access_token: Secret<String>,
    /// Provider-reported expiry as unix milliseconds
    pub expires_at: u64,
    pub account: Account,
    pub scopes: Vec<String>,
}

/// Parameters for an interactive sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveRequest {
    pub scopes: Vec<String>,
    pub prompt: Prompt,
    pub flow: FlowType,
}

/// Connection settings handed to `IdentityProvider::initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Application (client) id registered with the identity provider
    pub client_id: String,
    /// Tenant / directory id
    pub tenant_id: String,
    /// Authority host, e.g. `https://login.microsoftonline.com`
    pub authority: String,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: String,
    pub cache_tier: CacheTier,
    /// Emit protocol-level debug events
    pub logging_enabled: bool,
}

/// The part of a `ProviderConfig` that decides whether two configurations
/// talk to the same provider application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub authority: String,
    pub tenant_id: String,
    pub client_id: String,
}

impl ProviderConfig {
    pub fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            authority: self.authority_base().to_string(),
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
        }
    }

    pub fn authorize_endpoint(&self) -> String {
        self.endpoint("authorize")
    }

    pub fn token_endpoint(&self) -> String {
        self.endpoint("token")
    }

    pub fn logout_endpoint(&self) -> String {
        self.endpoint("logout")
    }

    fn endpoint(&self, leaf: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/{leaf}",
            self.authority_base(),
            self.tenant_id
        )
    }

    fn authority_base(&self) -> &str {
        self.authority.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            client_id: "client-1".into(),
            tenant_id: "tenant-1".into(),
            authority: "https://login.example.com/".into(),
            redirect_uri: "http://localhost:8400/callback".into(),
            post_logout_redirect_uri: "http://localhost:8400/".into(),
            cache_tier: CacheTier::Ephemeral,
            logging_enabled: false,
        }
    }

    #[test]
    fn endpoints_derive_from_authority_and_tenant() {
        let config = config();
        assert_eq!(
            config.token_endpoint(),
            "https://login.example.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(
            config.authorize_endpoint(),
            "https://login.example.com/tenant-1/oauth2/v2.0/authorize"
        );
        assert_eq!(
            config.logout_endpoint(),
            "https://login.example.com/tenant-1/oauth2/v2.0/logout"
        );
    }

    #[test]
    fn identity_ignores_trailing_slash_and_non_identity_fields() {
        let a = config();
        let mut b = config();
        b.authority = "https://login.example.com".into();
        b.cache_tier = CacheTier::Durable;
        b.logging_enabled = true;
        assert_eq!(a.identity(), b.identity());

        b.client_id = "client-2".into();
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn enums_deserialize_from_config_strings() {
        let flow: FlowType = serde_json::from_str("\"redirect\"").unwrap();
        assert_eq!(flow, FlowType::Redirect);
        let tier: CacheTier = serde_json::from_str("\"durable\"").unwrap();
        assert_eq!(tier, CacheTier::Durable);
        let prompt: Prompt = serde_json::from_str("\"select_account\"").unwrap();
        assert_eq!(prompt, Prompt::SelectAccount);
        assert_eq!(Prompt::Consent.as_str(), "consent");
    }
}
