//! Session configuration
//!
//! Deserialized from the `[session]` table of the host's TOML file. Only the
//! provider connection settings and scopes are required; everything else has
//! a default. `validate()` must pass before `SessionManager::initialize`
//! accepts a configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use identity::{CacheTier, FlowType, Prompt, ProviderConfig};
use serde::{Deserialize, Serialize};

/// Typical lifetime of an access token issued by the provider. The renewal
/// interval must fire before a token renewed on the previous tick goes stale.
pub const TYPICAL_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// OAuth scopes requested for every token.
///
/// Order is not significant: two `Scopes` are equal when they name the same
/// set of scopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scopes(Vec<String>);

impl Scopes {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(scopes.into_iter().map(Into::into).collect())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn set(&self) -> BTreeSet<&str> {
        self.0.iter().map(String::as_str).collect()
    }
}

impl PartialEq for Scopes {
    fn eq(&self, other: &Self) -> bool {
        self.set() == other.set()
    }
}

impl Eq for Scopes {}

impl From<Vec<String>> for Scopes {
    fn from(scopes: Vec<String>) -> Self {
        Self(scopes)
    }
}

/// Configuration for one `SessionManager`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub redirect_uri: String,
    pub scopes: Scopes,
    #[serde(default = "default_authority")]
    pub authority: String,
    /// Where the provider sends the browser after sign-out; defaults to
    /// `redirect_uri`
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,
    #[serde(default)]
    pub flow: FlowType,
    #[serde(default)]
    pub cache_tier: CacheTier,
    #[serde(default)]
    pub prompt: Prompt,
    /// Tokens are treated as expired this long before the reported expiry
    #[serde(default = "default_renewal_lead")]
    pub renewal_lead_secs: u64,
    /// Period of the background renewal timer
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,
    /// Pause after clearing a stuck interaction before retrying
    #[serde(default = "default_recovery_backoff")]
    pub recovery_backoff_ms: u64,
    /// Forward provider protocol events to the log
    #[serde(default)]
    pub logging: bool,
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".into()
}

fn default_renewal_lead() -> u64 {
    300
}

fn default_renewal_interval() -> u64 {
    1800
}

fn default_recovery_backoff() -> u64 {
    1500
}

impl SessionConfig {
    /// Configuration with the required fields set and everything else at its
    /// default.
    pub fn new(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Scopes,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            authority: default_authority(),
            post_logout_redirect_uri: None,
            flow: FlowType::default(),
            cache_tier: CacheTier::default(),
            prompt: Prompt::default(),
            renewal_lead_secs: default_renewal_lead(),
            renewal_interval_secs: default_renewal_interval(),
            recovery_backoff_ms: default_recovery_backoff(),
            logging: false,
        }
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> common::Result<()> {
        for (name, value) in [
            ("client_id", &self.client_id),
            ("tenant_id", &self.tenant_id),
            ("redirect_uri", &self.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(common::Error::Config(format!("{name} must not be empty")));
            }
        }

        for (name, value) in [
            ("authority", Some(&self.authority)),
            ("redirect_uri", Some(&self.redirect_uri)),
            (
                "post_logout_redirect_uri",
                self.post_logout_redirect_uri.as_ref(),
            ),
        ] {
            if let Some(value) = value
                && !value.starts_with("http://")
                && !value.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {value}"
                )));
            }
        }

        if self.scopes.is_empty() {
            return Err(common::Error::Config(
                "at least one scope is required".into(),
            ));
        }
        if let Some(bad) = self
            .scopes
            .as_slice()
            .iter()
            .find(|s| s.is_empty() || s.contains(char::is_whitespace))
        {
            return Err(common::Error::Config(format!(
                "scopes must be non-empty and contain no whitespace, got: {bad:?}"
            )));
        }

        if self.renewal_interval_secs == 0 {
            return Err(common::Error::Config(
                "renewal_interval_secs must be greater than 0".into(),
            ));
        }
        let usable = TYPICAL_TOKEN_LIFETIME.saturating_sub(self.renewal_lead());
        if usable.is_zero() {
            return Err(common::Error::Config(format!(
                "renewal_lead_secs must be less than {}",
                TYPICAL_TOKEN_LIFETIME.as_secs()
            )));
        }
        if self.renewal_interval() >= usable {
            return Err(common::Error::Config(format!(
                "renewal_interval_secs must be less than {} (token lifetime minus renewal lead)",
                usable.as_secs()
            )));
        }

        Ok(())
    }

    pub fn renewal_lead(&self) -> Duration {
        Duration::from_secs(self.renewal_lead_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }

    /// Provider connection settings derived from this configuration.
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            authority: self.authority.clone(),
            redirect_uri: self.redirect_uri.clone(),
            post_logout_redirect_uri: self
                .post_logout_redirect_uri
                .clone()
                .unwrap_or_else(|| self.redirect_uri.clone()),
            cache_tier: self.cache_tier,
            logging_enabled: self.logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new(
            "client-1",
            "tenant-1",
            "http://localhost:8400/callback",
            Scopes::new(["openid", "User.Read"]),
        )
    }

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
client_id = "client-1"
tenant_id = "tenant-1"
redirect_uri = "http://localhost:8400/callback"
scopes = ["openid", "User.Read"]
"#,
        )
        .unwrap();

        assert_eq!(config.authority, "https://login.microsoftonline.com");
        assert_eq!(config.flow, FlowType::Popup);
        assert_eq!(config.cache_tier, CacheTier::Ephemeral);
        assert_eq!(config.prompt, Prompt::SelectAccount);
        assert_eq!(config.renewal_lead(), Duration::from_secs(300));
        assert_eq!(config.renewal_interval(), Duration::from_secs(1800));
        assert_eq!(config.recovery_backoff(), Duration::from_millis(1500));
        assert!(!config.logging);
        assert_eq!(config, self::config());
        config.validate().unwrap();
    }

    #[test]
    fn full_toml_overrides() {
        let config: SessionConfig = toml::from_str(
            r#"
client_id = "client-1"
tenant_id = "tenant-1"
redirect_uri = "https://app.example.com/"
post_logout_redirect_uri = "https://app.example.com/bye"
scopes = ["api://backend/.default"]
authority = "https://login.example.com/"
flow = "redirect"
cache_tier = "durable"
prompt = "login"
renewal_lead_secs = 120
renewal_interval_secs = 600
recovery_backoff_ms = 250
logging = true
"#,
        )
        .unwrap();

        assert_eq!(config.flow, FlowType::Redirect);
        assert_eq!(config.cache_tier, CacheTier::Durable);
        assert_eq!(config.prompt, Prompt::Login);
        assert_eq!(config.recovery_backoff(), Duration::from_millis(250));
        config.validate().unwrap();

        let provider = config.provider_config();
        assert_eq!(provider.post_logout_redirect_uri, "https://app.example.com/bye");
        assert_eq!(provider.cache_tier, CacheTier::Durable);
        assert!(provider.logging_enabled);
    }

    #[test]
    fn post_logout_defaults_to_redirect_uri() {
        let provider = config().provider_config();
        assert_eq!(
            provider.post_logout_redirect_uri,
            "http://localhost:8400/callback"
        );
    }

    #[test]
    fn scope_order_is_not_significant() {
        assert_eq!(
            Scopes::new(["openid", "User.Read"]),
            Scopes::new(["User.Read", "openid"])
        );
        assert_ne!(Scopes::new(["openid"]), Scopes::new(["openid", "email"]));
    }

    #[test]
    fn rejects_empty_required_fields() {
        let mut c = config();
        c.client_id = " ".into();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn rejects_non_http_urls() {
        let mut c = config();
        c.authority = "login.microsoftonline.com".into();
        assert!(c.validate().unwrap_err().to_string().contains("authority"));

        let mut c = config();
        c.post_logout_redirect_uri = Some("app://bye".into());
        assert!(
            c.validate()
                .unwrap_err()
                .to_string()
                .contains("post_logout_redirect_uri")
        );
    }

    #[test]
    fn rejects_bad_scopes() {
        let mut c = config();
        c.scopes = Scopes::default();
        assert!(c.validate().is_err());

        let mut c = config();
        c.scopes = Scopes::new(["openid profile"]);
        assert!(c.validate().unwrap_err().to_string().contains("whitespace"));
    }

    #[test]
    fn renewal_interval_must_fit_inside_token_lifetime() {
        let mut c = config();
        c.renewal_interval_secs = 3300;
        assert!(c.validate().is_err());

        c.renewal_interval_secs = 3299;
        c.validate().unwrap();

        c.renewal_interval_secs = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.renewal_lead_secs = 3600;
        assert!(
            c.validate()
                .unwrap_err()
                .to_string()
                .contains("renewal_lead_secs")
        );
    }
}
