//! Token endpoint interactions
//!
//! 1. Authorization code exchange (interactive login completion)
//! 2. Refresh-token grant (silent renewal)
//!
//! Both POST a form to the configured token endpoint. OAuth error bodies
//! (`{"error": "...", "error_description": "..."}`) are surfaced as a
//! `ProviderError` with the server's code so the session layer can classify
//! them.

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result, codes};
use crate::types::ProviderConfig;

/// Token endpoint success body.
///
/// `expires_in` is a delta in seconds from the response time; the caller
/// converts it to an absolute unix millisecond timestamp.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Token endpoint error body (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
    verifier: &str,
    scopes: &[String],
) -> Result<TokenResponse> {
    let scope = scopes.join(" ");
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", config.client_id.as_str()),
        ("code", code),
        ("code_verifier", verifier),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("scope", scope.as_str()),
    ];
    post_token_form(client, config, &form, "code exchange").await
}

/// Redeem a refresh token for a new access token.
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &ProviderConfig,
    refresh: &str,
    scopes: &[String],
) -> Result<TokenResponse> {
    let scope = scopes.join(" ");
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", config.client_id.as_str()),
        ("refresh_token", refresh),
        ("scope", scope.as_str()),
    ];
    post_token_form(client, config, &form, "token refresh").await
}

async fn post_token_form(
    client: &reqwest::Client,
    config: &ProviderConfig,
    form: &[(&str, &str)],
    operation: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(config.token_endpoint())
        .form(form)
        .send()
        .await
        .map_err(|e| ProviderError::new(codes::NETWORK, format!("{operation} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(error_from_body(status.as_u16(), &body, operation));
    }

    response.json::<TokenResponse>().await.map_err(|e| {
        ProviderError::new(
            codes::INVALID_RESPONSE,
            format!("invalid {operation} response: {e}"),
        )
    })
}

/// Map a non-success token endpoint response to a provider error, keeping the
/// OAuth error code when the body carries one.
fn error_from_body(status: u16, body: &str, operation: &str) -> ProviderError {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(parsed) => ProviderError::new(
            parsed.error,
            parsed
                .error_description
                .unwrap_or_else(|| format!("{operation} returned {status}")),
        ),
        Err(_) => ProviderError::new(
            codes::SERVER,
            format!("{operation} returned {status}: {body}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_without_optional_fields() {
        let json = r#"{"access_token":"at_abc","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
        assert!(token.id_token.is_none());
    }

    #[test]
    fn oauth_error_body_keeps_server_code() {
        let body = r#"{"error":"invalid_grant","error_description":"AADSTS70008: expired"}"#;
        let err = error_from_body(400, body, "token refresh");
        assert_eq!(err.code(), codes::INVALID_GRANT);
        assert_eq!(err.description, "AADSTS70008: expired");
    }

    #[test]
    fn non_json_error_body_is_server_error() {
        let err = error_from_body(502, "Bad Gateway", "code exchange");
        assert_eq!(err.code(), codes::SERVER);
        assert!(err.description.contains("502"), "got: {}", err.description);
    }

    #[test]
    fn error_body_without_description_mentions_status() {
        let err = error_from_body(400, r#"{"error":"interaction_required"}"#, "token refresh");
        assert_eq!(err.code(), codes::INTERACTION_REQUIRED);
        assert!(err.description.contains("400"));
    }
}
