//! PKCE (Proof Key for Code Exchange) per RFC 7636 and authorization URLs
//!
//! The verifier stays with the client (in memory for popups, in the ephemeral
//! storage tier across a redirect) and is sent during the code exchange; the
//! S256 challenge goes into the authorization URL.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{ProviderError, Result, codes};
use crate::types::{Prompt, ProviderConfig};

/// Generate a random code verifier: 64 random bytes as URL-safe base64
/// (86 characters, inside RFC 7636's 43-128 range).
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the authorization URL for an interactive request.
///
/// `scopes` are joined in the caller's order. `state` is echoed back by the
/// authorization server and checked when the callback is consumed.
pub fn build_authorization_url(
    config: &ProviderConfig,
    scopes: &[String],
    prompt: Prompt,
    state: &str,
    challenge: &str,
) -> Result<String> {
    let scope = scopes.join(" ");
    let url = Url::parse_with_params(
        &config.authorize_endpoint(),
        &[
            ("client_id", config.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("response_mode", "query"),
            ("scope", scope.as_str()),
            ("prompt", prompt.as_str()),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
        ],
    )
    .map_err(|e| ProviderError::new(codes::INVALID_CONFIG, format!("authorize endpoint: {e}")))?;
    Ok(url.into())
}

/// Build the end-session URL that returns the browser to
/// `post_logout_redirect_uri`.
pub fn build_logout_url(config: &ProviderConfig, login_hint: Option<&str>) -> Result<String> {
    let mut params = vec![(
        "post_logout_redirect_uri",
        config.post_logout_redirect_uri.as_str(),
    )];
    if let Some(hint) = login_hint {
        params.push(("logout_hint", hint));
    }
    let url = Url::parse_with_params(&config.logout_endpoint(), &params)
        .map_err(|e| ProviderError::new(codes::INVALID_CONFIG, format!("logout endpoint: {e}")))?;
    Ok(url.into())
}
