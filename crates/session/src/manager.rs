//! Session manager
//!
//! Owns the token lifecycle for one identity provider connection. Built once
//! per host and shared as `Arc<SessionManager>`; every operation takes `&self`.
//!
//! Internal state is split across small synchronous locks that are never
//! held across an `.await`:
//! - `lifecycle`: stage, provider identity, authenticated / needs-login flags
//! - `cache`: the single cached bearer token
//! - `lock`: the single-flight interaction lock
//! - `renewal`: the armed renewal timer
//!
//! Logout and reset bump `epoch`. A token whose acquisition started under an
//! older epoch is handed to its caller but never cached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use common::Secret;
use identity::{
    Account, AuthResult, FlowType, IdentityProvider, InteractiveRequest, StorageTiers, now_millis,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedToken, PersistedToken, SESSION_NAMESPACE, TOKEN_KEY, TokenCache};
use crate::classify::{Classification, classify};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::lock::InteractionLock;
use crate::metrics::{self, TokenSource};
use crate::renewal;
use crate::state::{Lifecycle, Phase, SessionState, Stage, StatusSnapshot};

struct RenewalTimer {
    task: JoinHandle<()>,
    interval: Duration,
}

pub struct SessionManager {
    me: Weak<SessionManager>,
    provider: Arc<dyn IdentityProvider>,
    storage: StorageTiers,
    embedded: bool,
    config: RwLock<Option<Arc<SessionConfig>>>,
    lifecycle: Mutex<Lifecycle>,
    cache: TokenCache,
    lock: InteractionLock,
    renewal: Mutex<Option<RenewalTimer>>,
    epoch: AtomicU64,
    state_tx: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Create an uninitialized manager. Call `initialize` before anything else.
    pub fn new(provider: Arc<dyn IdentityProvider>, storage: StorageTiers) -> Arc<Self> {
        let embedded = provider.is_embedded_context();
        Arc::new_cyclic(|me| {
            let (state_tx, _) = watch::channel(SessionState {
                is_embedded_context: embedded,
                ..SessionState::default()
            });
            Self {
                me: me.clone(),
                provider,
                storage,
                embedded,
                config: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::new()),
                cache: TokenCache::new(),
                lock: InteractionLock::new(),
                renewal: Mutex::new(None),
                epoch: AtomicU64::new(0),
                state_tx,
            }
        })
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    pub fn is_embedded_context(&self) -> bool {
        self.embedded
    }

    /// The configuration from the last `initialize` call.
    pub fn config(&self) -> Option<Arc<SessionConfig>> {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Bring the session up for `config`.
    ///
    /// Idempotent for the same provider identity (authority, tenant, client).
    /// Always leaves the session out of the initializing state: a provider
    /// that cannot be constructed ends in the error phase with login required.
    pub async fn initialize(&self, config: SessionConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            let message = e.to_string();
            error!(error = %message, "rejected session configuration");
            let running = self.lifecycle().stage == Stage::Ready;
            if !running {
                self.fail_initialization(message.clone());
            }
            return Err(Error::Config(message));
        }

        let provider_config = config.provider_config();
        let identity = provider_config.identity();
        let reinitializing = {
            let mut lc = self.lifecycle();
            if lc.identity.as_ref() == Some(&identity)
                && matches!(lc.stage, Stage::Initializing | Stage::Ready)
            {
                debug!(client_id = %identity.client_id, "session already initialized");
                return Ok(());
            }
            let reinitializing = lc.stage == Stage::Ready;
            *lc = Lifecycle {
                stage: Stage::Initializing,
                identity: Some(identity),
                ..Lifecycle::new()
            };
            reinitializing
        };

        if reinitializing {
            info!("provider identity changed, re-initializing session");
            self.stop_renewal();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.cache.clear();
            self.lock.clear();
        }

        let config = Arc::new(config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        self.publish();

        let flow = self.effective_flow(&config);
        if flow != config.flow {
            info!("embedded context, using popup flow instead of redirect");
        }
        info!(
            provider = self.provider.id(),
            client_id = %config.client_id,
            tenant_id = %config.tenant_id,
            flow = flow.label(),
            "initializing session"
        );

        if let Err(e) = self.provider.initialize(&provider_config).await {
            error!(provider = self.provider.id(), error = %e, "identity provider initialization failed");
            let err = Error::InitializationFailed(e.to_string());
            self.fail_initialization(err.to_string());
            return Err(err);
        }

        // Second half of a redirect login started before the last navigation
        if flow == FlowType::Redirect
            && let Err(e) = self.consume_redirect_response(&config).await
        {
            warn!(error = %e, "could not complete redirect login");
            self.lifecycle().error = Some(e.to_string());
        }

        match self.provider.clear_interaction_state().await {
            Ok(true) => {
                warn!("found an interaction left over from a previous run");
                self.recover_stuck_interaction(&config).await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to probe for a stuck interaction"),
        }

        let accounts = match self.provider.accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "failed to list accounts, login required");
                self.lifecycle().error = Some(e.to_string());
                Vec::new()
            }
        };
        let Some(account) = accounts.into_iter().next() else {
            info!("no signed-in account, login required");
            self.finish_initialization(false);
            return Ok(());
        };

        self.restore_persisted_token(&config, &account).await;
        match self.acquire_silent_with(&config).await {
            Ok(_) => {
                info!(account_id = %account.id, "session authenticated");
                self.finish_initialization(true);
                self.start_renewal(&config);
            }
            Err(e) => {
                info!(account_id = %account.id, error = %e, "silent acquisition failed at startup, login required");
                self.finish_initialization(false);
            }
        }
        Ok(())
    }

    /// Pick up a redirect login response delivered after initialization.
    /// Returns whether one was consumed.
    pub async fn resume_redirect(&self) -> Result<bool> {
        let config = self.ready_config()?;
        match self.consume_redirect_response(&config).await {
            Ok(true) => {
                self.start_renewal(&config);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.login_failed(&e);
                Err(e)
            }
        }
    }

    /// A token without user interaction: the cached one while fresh,
    /// otherwise a silent renewal through the provider.
    pub async fn acquire_silent(&self) -> Result<Secret<String>> {
        let config = self.ready_config()?;
        self.acquire_silent_with(&config).await
    }

    /// A token, escalating to interactive login when silent acquisition
    /// cannot succeed. Retries silently once after stuck-interaction recovery.
    pub async fn get_access_token(&self) -> Result<Secret<String>> {
        let config = self.ready_config()?;
        let mut retried = false;
        loop {
            match self.acquire_silent_with(&config).await {
                Ok(token) => return Ok(token),
                Err(Error::InteractionInProgress(reason)) if !retried => {
                    info!(reason = %reason, "retrying silent acquisition after recovery");
                    retried = true;
                }
                Err(
                    e @ (Error::NoAccount
                    | Error::InteractionRequired(_)
                    | Error::SilentRefreshFailed(_)),
                ) => {
                    info!(reason = %e, "escalating to interactive login");
                    self.lifecycle().needs_login = true;
                    self.publish();
                    let result = self.login_interactive_with(&config).await?;
                    return Ok(result.access_token);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sign the user in interactively. Rejected with `LoginAlreadyInProgress`
    /// while another interactive login is in flight.
    ///
    /// With the redirect flow the returned future never resolves; the result
    /// arrives through `resume_redirect` or the next `initialize`.
    pub async fn login_interactive(&self) -> Result<AuthResult> {
        let config = self.ready_config()?;
        self.login_interactive_with(&config).await
    }

    /// Sign out. Local session state is cleared even when the provider
    /// sign-out fails; that failure is still returned.
    pub async fn logout(&self) -> Result<()> {
        let config = self.ready_config()?;
        self.stop_renewal();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
        self.lock.clear();
        {
            let mut lc = self.lifecycle();
            lc.authenticated = false;
            lc.needs_login = true;
            lc.error = None;
        }
        self.publish();
        self.remove_persisted_token(&config).await;

        let outcome = match self.current_account().await {
            Ok(Some(account)) => {
                info!(account_id = %account.id, "signing out");
                self.provider
                    .end_session(&account, self.effective_flow(&config))
                    .await
                    .map_err(Error::from)
            }
            Ok(None) => {
                debug!("logout with no signed-in account");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "provider sign-out failed, local session cleared anyway");
        }
        outcome
    }

    /// Drop every trace of the session: timer, lock, cache, and all keys the
    /// session and provider own in both storage tiers. The manager must be
    /// initialized again afterwards. Safe to call repeatedly.
    pub async fn clear_authentication_state(&self) -> Result<()> {
        self.stop_renewal();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.lock.clear();
        self.cache.clear();
        *self.lifecycle() = Lifecycle {
            needs_login: true,
            ..Lifecycle::new()
        };
        self.publish();

        let mut swept = 0;
        for prefix in [self.provider.storage_namespace(), SESSION_NAMESPACE] {
            swept += self.storage.sweep(prefix).await?;
        }
        info!(swept, "authentication state cleared");
        Ok(())
    }

    /// Discard the cached token and obtain a new one, escalating like
    /// `get_access_token`.
    pub async fn force_refresh_token(&self) -> Result<Secret<String>> {
        let config = self.ready_config()?;
        info!("forcing token refresh");
        self.cache.clear();
        self.remove_persisted_token(&config).await;
        self.publish();
        self.get_access_token().await
    }

    /// Subscribe to state changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Current state, computed now. The bearer is present only while fresh.
    pub fn state(&self) -> SessionState {
        let lc = self.lifecycle().clone();
        let token = if lc.authenticated {
            self.cache.fresh(now_millis()).map(|t| t.bearer)
        } else {
            None
        };
        SessionState {
            initializing: lc.stage == Stage::Initializing,
            authenticated: lc.authenticated,
            needs_login: lc.needs_login,
            error: lc.error,
            token,
            is_embedded_context: self.embedded,
        }
    }

    pub fn phase(&self) -> Phase {
        let fresh = self.cache.fresh(now_millis()).is_some();
        self.lifecycle().phase(fresh)
    }

    /// Diagnostic snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        let lc = self.lifecycle().clone();
        let initialized = lc.stage == Stage::Ready;
        let account_count = if initialized {
            match self.provider.accounts().await {
                Ok(accounts) => accounts.len(),
                Err(e) => {
                    debug!(error = %e, "failed to count accounts for status");
                    0
                }
            }
        } else {
            0
        };

        let token = self.cache.peek();
        let has_token = token
            .as_ref()
            .is_some_and(|t| t.is_fresh_at(now_millis()));
        let renewal_interval_secs = self
            .renewal_slot()
            .as_ref()
            .map(|timer| timer.interval.as_secs());
        let flow = self.config().map(|c| self.effective_flow(&c));

        StatusSnapshot {
            phase: lc.phase(has_token),
            initialized,
            has_token,
            token_expiry: token.map(|t| t.refresh_at),
            login_in_progress: self.lock.is_held(),
            account_count,
            flow,
            renewal_interval_secs,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.lifecycle().stage == Stage::Ready
    }

    /// Called by the renewal task when the provider no longer lists an
    /// account.
    pub(crate) async fn account_lost(&self) {
        // Detach rather than abort: the caller is the timer task itself
        drop(self.renewal_slot().take());
        self.cache.clear();
        if let Some(config) = self.config() {
            self.remove_persisted_token(&config).await;
        }
        {
            let mut lc = self.lifecycle();
            lc.authenticated = false;
            lc.needs_login = true;
        }
        self.publish();
    }

    async fn acquire_silent_with(&self, config: &SessionConfig) -> Result<Secret<String>> {
        if let Some(token) = self.cache.fresh(now_millis()) {
            metrics::record_token_request(TokenSource::Cache, "ok");
            return Ok(token.bearer);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(account) = self.current_account().await? else {
            metrics::record_token_request(TokenSource::Silent, "no_account");
            return Err(Error::NoAccount);
        };

        debug!(account_id = %account.id, "renewing token silently");
        match self
            .provider
            .acquire_token_silent(&account, config.scopes.as_slice())
            .await
        {
            Ok(result) => {
                metrics::record_token_request(TokenSource::Silent, "ok");
                if self.accept_result(config, &result, epoch).await && self.is_ready() {
                    self.ensure_renewal(config);
                }
                Ok(result.access_token)
            }
            Err(e) => {
                metrics::record_token_request(TokenSource::Silent, "error");
                match classify(&e) {
                    Classification::InteractionInProgress => {
                        self.recover_stuck_interaction(config).await;
                        Err(Error::InteractionInProgress(e.description))
                    }
                    Classification::InteractionRequired => {
                        debug!(error = %e, "silent acquisition needs interaction");
                        Err(Error::InteractionRequired(e.to_string()))
                    }
                    _ => {
                        warn!(error = %e, "silent token acquisition failed");
                        Err(Error::SilentRefreshFailed(e.to_string()))
                    }
                }
            }
        }
    }

    async fn login_interactive_with(&self, config: &SessionConfig) -> Result<AuthResult> {
        let Some(guard) = self.lock.try_acquire() else {
            warn!("interactive login requested while another is in progress");
            return Err(Error::LoginAlreadyInProgress);
        };
        self.publish();

        let request = InteractiveRequest {
            scopes: config.scopes.to_vec(),
            prompt: config.prompt,
            flow: self.effective_flow(config),
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        let started = Instant::now();
        info!(
            flow = request.flow.label(),
            prompt = request.prompt.as_str(),
            "starting interactive login"
        );

        let outcome = self.provider.acquire_token_interactive(&request).await;
        drop(guard);
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => {
                info!(account_id = %result.account.id, "interactive login succeeded");
                metrics::record_token_request(TokenSource::Interactive, "ok");
                metrics::record_login_duration("ok", elapsed);
                if self.accept_result(config, &result, epoch).await {
                    self.start_renewal(config);
                }
                Ok(result)
            }
            Err(e) => {
                metrics::record_token_request(TokenSource::Interactive, "error");
                metrics::record_login_duration("error", elapsed);
                let err = match classify(&e) {
                    Classification::InteractionInProgress => {
                        self.recover_stuck_interaction(config).await;
                        Error::InteractionInterrupted
                    }
                    Classification::UserCancelled => Error::UserCancelled,
                    Classification::PopupBlocked => Error::PopupBlocked,
                    _ => Error::Provider(e),
                };
                warn!(error = %err, "interactive login failed");
                self.login_failed(&err);
                Err(err)
            }
        }
    }

    async fn consume_redirect_response(&self, config: &SessionConfig) -> Result<bool> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        match self.provider.handle_redirect_response().await {
            Ok(Some(result)) => {
                info!(account_id = %result.account.id, "resumed redirect login");
                metrics::record_token_request(TokenSource::Redirect, "ok");
                Ok(self.accept_result(config, &result, epoch).await)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                metrics::record_token_request(TokenSource::Redirect, "error");
                Err(match classify(&e) {
                    Classification::UserCancelled => Error::UserCancelled,
                    _ => Error::Provider(e),
                })
            }
        }
    }

    /// Reset after an interaction that never completed: release the lock,
    /// drop the cache, clear the provider marker, then pause before the
    /// caller retries.
    async fn recover_stuck_interaction(&self, config: &SessionConfig) {
        warn!(
            backoff_ms = config.recovery_backoff_ms,
            "stuck interaction detected, resetting interaction state"
        );
        metrics::record_stuck_recovery();
        self.lock.clear();
        self.cache.clear();
        if let Err(e) = self.provider.clear_interaction_state().await {
            warn!(error = %e, "failed to clear provider interaction state");
        }
        self.publish();
        tokio::time::sleep(config.recovery_backoff()).await;
    }

    /// Cache a freshly acquired token. Returns false if a logout or reset
    /// happened since `epoch`, in which case nothing is kept.
    ///
    /// Cache and lifecycle are updated before the first await; a sign-out
    /// that lands while the token is being persisted undoes the write.
    async fn accept_result(&self, config: &SessionConfig, result: &AuthResult, epoch: u64) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("discarding token acquired before sign-out");
            return false;
        }

        let token = CachedToken::from_result(result, config.renewal_lead());
        self.cache.store(token.clone());
        {
            let mut lc = self.lifecycle();
            if lc.stage == Stage::Ready {
                lc.authenticated = true;
                lc.needs_login = false;
                lc.error = None;
            }
        }
        self.publish();

        self.persist_token(config, &token).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("sign-out during token persistence, removing stored token");
            self.remove_persisted_token(config).await;
            return false;
        }
        true
    }

    async fn current_account(&self) -> Result<Option<Account>> {
        Ok(self.provider.accounts().await?.into_iter().next())
    }

    async fn persist_token(&self, config: &SessionConfig, token: &CachedToken) {
        let raw = match serde_json::to_string(&token.to_persisted()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize token for storage");
                return;
            }
        };
        if let Err(e) = self.storage.tier(config.cache_tier).set(TOKEN_KEY, raw).await {
            warn!(error = %e, "failed to persist token");
        }
    }

    async fn remove_persisted_token(&self, config: &SessionConfig) {
        if let Err(e) = self.storage.tier(config.cache_tier).remove(TOKEN_KEY).await {
            warn!(error = %e, "failed to remove persisted token");
        }
    }

    /// Seed the cache from storage if the persisted token is still fresh and
    /// belongs to `account`.
    async fn restore_persisted_token(&self, config: &SessionConfig, account: &Account) {
        let store = self.storage.tier(config.cache_tier);
        let raw = match store.get(TOKEN_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read persisted token");
                return;
            }
        };
        let token = match serde_json::from_str::<PersistedToken>(&raw) {
            Ok(persisted) => persisted.into_cached(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable persisted token");
                if let Err(e) = store.remove(TOKEN_KEY).await {
                    warn!(error = %e, "failed to remove persisted token");
                }
                return;
            }
        };
        if token.account.id != account.id || !token.is_fresh_at(now_millis()) {
            debug!("persisted token is stale or belongs to another account");
            return;
        }
        debug!(account_id = %account.id, "restored persisted token");
        self.cache.store(token);
    }

    fn start_renewal(&self, config: &SessionConfig) {
        let interval = renewal::effective_interval(
            config.renewal_interval(),
            self.cache.peek().as_ref(),
            now_millis(),
        );
        let task = renewal::spawn_renewal_task(self.me.clone(), config.renewal_interval());
        let previous = self
            .renewal_slot()
            .replace(RenewalTimer { task, interval });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        info!(interval_secs = interval.as_secs(), "renewal timer armed");
    }

    fn ensure_renewal(&self, config: &SessionConfig) {
        let running = self.renewal_slot().is_some();
        if !running {
            self.start_renewal(config);
        }
    }

    fn stop_renewal(&self) {
        let timer = self.renewal_slot().take();
        if let Some(timer) = timer {
            timer.task.abort();
            debug!("renewal timer stopped");
        }
    }

    fn finish_initialization(&self, authenticated: bool) {
        {
            let mut lc = self.lifecycle();
            lc.stage = Stage::Ready;
            lc.authenticated = authenticated;
            lc.needs_login = !authenticated;
        }
        self.publish();
    }

    fn fail_initialization(&self, message: String) {
        {
            let mut lc = self.lifecycle();
            lc.stage = Stage::Failed;
            lc.authenticated = false;
            lc.needs_login = true;
            lc.error = Some(message);
        }
        self.publish();
    }

    fn login_failed(&self, err: &Error) {
        let fresh = self.cache.fresh(now_millis()).is_some();
        {
            let mut lc = self.lifecycle();
            lc.authenticated = fresh;
            lc.needs_login = true;
            lc.error = Some(err.to_string());
        }
        self.publish();
    }

    fn ready_config(&self) -> Result<Arc<SessionConfig>> {
        if !self.is_ready() {
            return Err(Error::NotInitialized);
        }
        self.config().ok_or(Error::NotInitialized)
    }

    /// Redirect is unavailable inside an embedded frame.
    fn effective_flow(&self, config: &SessionConfig) -> FlowType {
        if self.embedded && config.flow == FlowType::Redirect {
            FlowType::Popup
        } else {
            config.flow
        }
    }

    pub(crate) fn cached_token(&self) -> Option<CachedToken> {
        self.cache.peek()
    }

    /// Recompute the observable state and notify subscribers if it changed.
    pub(crate) fn publish(&self) {
        let next = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn renewal_slot(&self) -> MutexGuard<'_, Option<RenewalTimer>> {
        self.renewal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let timer = self
            .renewal
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.task.abort();
        }
    }
}
