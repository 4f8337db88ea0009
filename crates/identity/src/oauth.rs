//! OAuth2/OIDC provider: authorization code + PKCE, refresh-token renewal
//!
//! Storage layout (all keys under the `oidc.` namespace):
//! - `oidc.account.<id>`      account record + refresh token, configured tier
//! - `oidc.interaction`       in-flight interactive request marker, ephemeral
//! - `oidc.request`           PKCE verifier/state across a redirect, ephemeral
//! - `oidc.redirect.response` callback query awaiting resume, ephemeral
//!
//! The browser side of an interactive flow (opening a popup, navigating the
//! page) is delegated to a `UserAgent` supplied by the host.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result, codes};
use crate::storage::{KeyValueStore, StorageTiers};
use crate::token::{self, TokenResponse};
use crate::types::{
    Account, AuthResult, FlowType, InteractiveRequest, ProviderConfig, now_millis,
};
use crate::{BoxFuture, IdentityProvider, pkce};

const NAMESPACE: &str = "oidc.";
const ACCOUNT_PREFIX: &str = "oidc.account.";
const INTERACTION_KEY: &str = "oidc.interaction";
const PENDING_REQUEST_KEY: &str = "oidc.request";
const REDIRECT_RESPONSE_KEY: &str = "oidc.redirect.response";

/// Age after which an interaction marker is treated as abandoned.
const INTERACTION_TIMEOUT_MILLIS: u64 = 600_000; // 10 minutes

/// Host-side browser capability.
pub trait UserAgent: Send + Sync {
    /// Open `url` in a popup and resolve with the callback URL or query string
    /// the popup was redirected to. Fails with `popup_window_error` if the
    /// popup could not be opened and `user_cancelled` if it was closed.
    fn open_popup<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Navigate the host away to `url`.
    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Whether the host runs inside an embedded frame.
    fn is_embedded(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    account: Account,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// PKCE material for an interactive request that has not completed yet.
#[derive(Debug, Serialize, Deserialize)]
struct PendingRequest {
    state: String,
    verifier: String,
    scopes: Vec<String>,
}

/// `IdentityProvider` speaking OAuth2/OIDC to an authority's v2.0 endpoints.
pub struct OAuthProvider {
    http: reqwest::Client,
    storage: StorageTiers,
    user_agent: Arc<dyn UserAgent>,
    config: RwLock<Option<ProviderConfig>>,
}

impl OAuthProvider {
    pub fn new(
        http: reqwest::Client,
        storage: StorageTiers,
        user_agent: Arc<dyn UserAgent>,
    ) -> Self {
        Self {
            http,
            storage,
            user_agent,
            config: RwLock::new(None),
        }
    }

    /// Record the callback of a redirect login so the next
    /// `handle_redirect_response` can complete it.
    pub async fn deliver_redirect(&self, callback: &str) -> Result<()> {
        self.storage
            .ephemeral
            .set(REDIRECT_RESPONSE_KEY, callback.to_string())
            .await?;
        debug!("redirect response stored for resume");
        Ok(())
    }

    async fn config(&self) -> Result<ProviderConfig> {
        self.config.read().await.clone().ok_or_else(|| {
            ProviderError::new(codes::UNINITIALIZED, "provider used before initialize")
        })
    }

    fn account_store<'a>(&'a self, config: &ProviderConfig) -> &'a Arc<dyn KeyValueStore> {
        self.storage.tier(config.cache_tier)
    }

    async fn load_account(
        &self,
        config: &ProviderConfig,
        account_id: &str,
    ) -> Result<Option<AccountRecord>> {
        let Some(raw) = self
            .account_store(config)
            .get(&account_key(account_id))
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            ProviderError::new(codes::STORAGE, format!("corrupt account record: {e}"))
        })
    }

    /// Persist `record` as the only signed-in account.
    async fn store_account(&self, config: &ProviderConfig, record: &AccountRecord) -> Result<()> {
        let store = self.account_store(config);
        let key = account_key(&record.account.id);
        for existing in store.keys().await? {
            if existing.starts_with(ACCOUNT_PREFIX) && existing != key {
                store.remove(&existing).await?;
            }
        }
        let json = serde_json::to_string(record).map_err(|e| {
            ProviderError::new(codes::STORAGE, format!("serializing account record: {e}"))
        })?;
        store.set(&key, json).await?;
        Ok(())
    }

    /// Claim the interaction marker, failing if a live one is present.
    async fn begin_interaction(&self) -> Result<()> {
        let store = &self.storage.ephemeral;
        if let Some(started) = store.get(INTERACTION_KEY).await? {
            let started: u64 = started.parse().unwrap_or(0);
            if now_millis().saturating_sub(started) < INTERACTION_TIMEOUT_MILLIS {
                return Err(ProviderError::new(
                    codes::INTERACTION_IN_PROGRESS,
                    "an interactive request is already in progress",
                ));
            }
            warn!("discarding abandoned interaction marker");
        }
        store
            .set(INTERACTION_KEY, now_millis().to_string())
            .await?;
        Ok(())
    }

    async fn end_interaction(&self) {
        if let Err(e) = self.storage.ephemeral.remove(INTERACTION_KEY).await {
            warn!(error = %e, "failed to clear interaction marker");
        }
    }

    /// Persist the pending request and send the user agent to `url`.
    async fn begin_redirect(&self, url: &str, pending: &PendingRequest) -> Result<()> {
        let stored = serde_json::to_string(pending).map_err(|e| {
            ProviderError::new(codes::STORAGE, format!("serializing request: {e}"))
        })?;
        self.storage
            .ephemeral
            .set(PENDING_REQUEST_KEY, stored)
            .await?;
        if let Err(e) = self.user_agent.navigate(url).await {
            if let Err(remove_err) = self.storage.ephemeral.remove(PENDING_REQUEST_KEY).await {
                warn!(error = %remove_err, "failed to discard pending redirect request");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn run_popup(
        &self,
        config: &ProviderConfig,
        url: &str,
        pending: &PendingRequest,
    ) -> Result<AuthResult> {
        let callback = self.user_agent.open_popup(url).await?;
        self.complete_authorization(config, &callback, pending).await
    }

    /// Validate a callback against the pending request and redeem its code.
    async fn complete_authorization(
        &self,
        config: &ProviderConfig,
        callback: &str,
        pending: &PendingRequest,
    ) -> Result<AuthResult> {
        let params = callback_params(callback)?;

        if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| error.clone());
            let code = if error == "access_denied" {
                codes::USER_CANCELLED
            } else {
                error.as_str()
            };
            return Err(ProviderError::new(code, description));
        }

        if params.get("state") != Some(&pending.state) {
            return Err(ProviderError::new(
                codes::STATE_MISMATCH,
                "callback state does not match the pending request",
            ));
        }

        let code = params.get("code").ok_or_else(|| {
            ProviderError::new(
                codes::INVALID_RESPONSE,
                "callback carries no authorization code",
            )
        })?;

        if config.logging_enabled {
            debug!(endpoint = %config.token_endpoint(), "exchanging authorization code");
        }
        let response =
            token::exchange_code(&self.http, config, code, &pending.verifier, &pending.scopes)
                .await?;

        let account = account_from_id_token(response.id_token.as_deref())
            .unwrap_or_else(|| Account::new(uuid::Uuid::new_v4().to_string()));
        self.store_account(
            config,
            &AccountRecord {
                account: account.clone(),
                refresh_token: response.refresh_token.clone(),
            },
        )
        .await?;
        info!(account_id = account.id, "interactive login completed");

        Ok(auth_result(response, account, &pending.scopes))
    }
}

impl IdentityProvider for OAuthProvider {
    fn id(&self) -> &str {
        "oauth"
    }

    fn storage_namespace(&self) -> &str {
        NAMESPACE
    }

    fn is_embedded_context(&self) -> bool {
        self.user_agent.is_embedded()
    }

    fn initialize<'a>(&'a self, config: &'a ProviderConfig) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Url::parse(&config.token_endpoint()).map_err(|e| {
                ProviderError::new(
                    codes::INVALID_CONFIG,
                    format!("invalid authority {}: {e}", config.authority),
                )
            })?;
            if config.logging_enabled {
                debug!(
                    authority = config.authority,
                    tenant_id = config.tenant_id,
                    client_id = config.client_id,
                    "oauth provider configured"
                );
            }
            *self.config.write().await = Some(config.clone());
            Ok(())
        })
    }

    fn accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let config = self.config().await?;
            let mut keys: Vec<String> = self
                .account_store(&config)
                .keys()
                .await?
                .into_iter()
                .filter(|k| k.starts_with(ACCOUNT_PREFIX))
                .collect();
            keys.sort();

            let mut accounts = Vec::with_capacity(keys.len());
            for key in keys {
                let id = &key[ACCOUNT_PREFIX.len()..];
                if let Some(record) = self.load_account(&config, id).await? {
                    accounts.push(record.account);
                }
            }
            Ok(accounts)
        })
    }

    fn acquire_token_silent<'a>(
        &'a self,
        account: &'a Account,
        scopes: &'a [String],
    ) -> BoxFuture<'a, Result<AuthResult>> {
        Box::pin(async move {
            let config = self.config().await?;
            let mut record = self.load_account(&config, &account.id).await?.ok_or_else(|| {
                ProviderError::new(codes::NO_ACCOUNT, format!("unknown account {}", account.id))
            })?;
            let refresh = record.refresh_token.clone().ok_or_else(|| {
                ProviderError::new(codes::LOGIN_REQUIRED, "account has no refresh token")
            })?;

            if config.logging_enabled {
                debug!(account_id = account.id, "redeeming refresh token");
            }
            let response = token::refresh_token(&self.http, &config, &refresh, scopes).await?;

            if let Some(rotated) = response.refresh_token.clone()
                && rotated != refresh
            {
                record.refresh_token = Some(rotated);
                self.store_account(&config, &record).await?;
                debug!(account_id = account.id, "refresh token rotated");
            }

            Ok(auth_result(response, record.account, scopes))
        })
    }

    fn acquire_token_interactive<'a>(
        &'a self,
        request: &'a InteractiveRequest,
    ) -> BoxFuture<'a, Result<AuthResult>> {
        Box::pin(async move {
            let config = self.config().await?;
            self.begin_interaction().await?;

            let verifier = pkce::generate_verifier();
            let challenge = pkce::compute_challenge(&verifier);
            let pending = PendingRequest {
                state: uuid::Uuid::new_v4().to_string(),
                verifier,
                scopes: request.scopes.clone(),
            };
            let url = match pkce::build_authorization_url(
                &config,
                &request.scopes,
                request.prompt,
                &pending.state,
                &challenge,
            ) {
                Ok(url) => url,
                Err(e) => {
                    self.end_interaction().await;
                    return Err(e);
                }
            };
            if config.logging_enabled {
                debug!(url, flow = request.flow.label(), "starting interactive request");
            }

            match request.flow {
                FlowType::Popup => {
                    let outcome = self.run_popup(&config, &url, &pending).await;
                    self.end_interaction().await;
                    outcome
                }
                FlowType::Redirect => {
                    if let Err(e) = self.begin_redirect(&url, &pending).await {
                        self.end_interaction().await;
                        return Err(e);
                    }
                    info!("navigated away for redirect login, awaiting resume");
                    std::future::pending().await
                }
            }
        })
    }

    fn handle_redirect_response(&self) -> BoxFuture<'_, Result<Option<AuthResult>>> {
        Box::pin(async move {
            let config = self.config().await?;
            let store = &self.storage.ephemeral;
            let Some(callback) = store.get(REDIRECT_RESPONSE_KEY).await? else {
                return Ok(None);
            };
            store.remove(REDIRECT_RESPONSE_KEY).await?;
            let pending = store.get(PENDING_REQUEST_KEY).await?;
            store.remove(PENDING_REQUEST_KEY).await?;
            self.end_interaction().await;

            let pending: PendingRequest = pending
                .ok_or_else(|| {
                    ProviderError::new(
                        codes::STATE_MISMATCH,
                        "redirect response without a pending request",
                    )
                })
                .and_then(|raw| {
                    serde_json::from_str(&raw).map_err(|e| {
                        ProviderError::new(codes::STORAGE, format!("corrupt pending request: {e}"))
                    })
                })?;

            self.complete_authorization(&config, &callback, &pending)
                .await
                .map(Some)
        })
    }

    fn end_session<'a>(
        &'a self,
        account: &'a Account,
        flow: FlowType,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let config = self.config().await?;
            self.account_store(&config)
                .remove(&account_key(&account.id))
                .await?;
            let url = pkce::build_logout_url(&config, account.username.as_deref())?;
            info!(account_id = account.id, flow = flow.label(), "ending provider session");
            match flow {
                FlowType::Redirect => self.user_agent.navigate(&url).await,
                FlowType::Popup => self.user_agent.open_popup(&url).await.map(|_| ()),
            }
        })
    }

    fn clear_interaction_state(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.storage.ephemeral.remove(INTERACTION_KEY).await?) })
    }
}

fn account_key(account_id: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account_id}")
}

fn auth_result(response: TokenResponse, account: Account, requested: &[String]) -> AuthResult {
    let scopes = match response.scope {
        Some(granted) => granted.split_whitespace().map(str::to_string).collect(),
        None => requested.to_vec(),
    };
    AuthResult {
        access_token: response.access_token.into(),
        expires_at: now_millis().saturating_add(response.expires_in.saturating_mul(1000)),
        account,
        scopes,
    }
}

/// Parse a callback given either as a full URL or as a bare query string.
fn callback_params(callback: &str) -> Result<HashMap<String, String>> {
    let url = if callback.starts_with("http://") || callback.starts_with("https://") {
        Url::parse(callback)
    } else {
        Url::parse(&format!(
            "http://callback.invalid/?{}",
            callback.trim_start_matches('?')
        ))
    }
    .map_err(|e| ProviderError::new(codes::INVALID_RESPONSE, format!("malformed callback: {e}")))?;
    Ok(url.query_pairs().into_owned().collect())
}

/// Read the account identity from the id_token's claims. The signature is
/// not checked here; the token came straight from the token endpoint.
fn account_from_id_token(id_token: Option<&str>) -> Option<Account> {
    let payload = id_token?.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let id = claims
        .get("oid")
        .or_else(|| claims.get("sub"))?
        .as_str()?
        .to_string();
    let username = claims
        .get("preferred_username")
        .or_else(|| claims.get("email"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(Account { id, username })
}
