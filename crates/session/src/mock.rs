//! Scripted identity provider for session tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use common::Secret;
use identity::{
    Account, AuthResult, BoxFuture, FlowType, IdentityProvider, InteractiveRequest,
    KeyValueStore, MemoryStore, ProviderConfig, ProviderError, Result, StorageError, codes,
    now_millis,
};
use tokio::sync::Notify;

/// A token for `account` expiring `expires_in_secs` from now (negative for
/// already expired).
pub(crate) fn token(bearer: &str, account: &str, expires_in_secs: i64) -> AuthResult {
    let expires_at = (now_millis() as i64 + expires_in_secs * 1000).max(0) as u64;
    AuthResult {
        access_token: Secret::new(bearer.into()),
        expires_at,
        account: Account::new(account),
        scopes: vec!["openid".into(), "User.Read".into()],
    }
}

pub(crate) fn provider_error(code: &str) -> ProviderError {
    ProviderError::new(code, "scripted failure")
}

#[derive(Default)]
pub(crate) struct Calls {
    pub initialize: AtomicUsize,
    pub accounts: AtomicUsize,
    pub silent: AtomicUsize,
    pub interactive: AtomicUsize,
    pub redirect: AtomicUsize,
    pub end_session: AtomicUsize,
    pub clear_interaction: AtomicUsize,
}

pub(crate) fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Provider whose responses are queued by the test. With nothing queued,
/// silent acquisition succeeds for the first account (or fails with
/// `no_account_error`) and interactive login signs in `user-1`.
#[derive(Default)]
pub(crate) struct MockProvider {
    pub calls: Calls,
    embedded: bool,
    accounts: Mutex<Vec<Account>>,
    silent: Mutex<VecDeque<Result<AuthResult>>>,
    interactive: Mutex<VecDeque<Result<AuthResult>>>,
    redirect: Mutex<Option<Result<AuthResult>>>,
    init_error: Mutex<Option<ProviderError>>,
    stuck: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    silent_gated: AtomicBool,
    silent_gate: Notify,
    end_session_gated: AtomicBool,
    end_session_gate: Notify,
    last_request: Mutex<Option<InteractiveRequest>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embedded() -> Self {
        Self {
            embedded: true,
            ..Self::default()
        }
    }

    pub fn with_account(self, id: &str) -> Self {
        locked(&self.accounts).push(Account::new(id));
        self
    }

    pub fn push_silent(&self, result: Result<AuthResult>) {
        locked(&self.silent).push_back(result);
    }

    pub fn push_interactive(&self, result: Result<AuthResult>) {
        locked(&self.interactive).push_back(result);
    }

    pub fn set_redirect(&self, result: Result<AuthResult>) {
        *locked(&self.redirect) = Some(result);
    }

    pub fn fail_initialize(&self, err: ProviderError) {
        *locked(&self.init_error) = Some(err);
    }

    /// Leave an interaction marker behind, as a crashed earlier run would.
    pub fn set_stuck(&self) {
        self.stuck.store(true, Ordering::SeqCst);
    }

    pub fn remove_accounts(&self) {
        locked(&self.accounts).clear();
    }

    /// Hold the next interactive login until `release_interactive`.
    pub fn gate_interactive(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_interactive(&self) {
        self.gate.notify_one();
    }

    /// Hold the next silent acquisition until `release_silent`.
    pub fn gate_silent(&self) {
        self.silent_gated.store(true, Ordering::SeqCst);
    }

    pub fn release_silent(&self) {
        self.silent_gate.notify_one();
    }

    /// Hold the next sign-out after the account record is gone, as a
    /// sign-out window left open would.
    pub fn gate_end_session(&self) {
        self.end_session_gated.store(true, Ordering::SeqCst);
    }

    pub fn release_end_session(&self) {
        self.end_session_gate.notify_one();
    }

    pub fn last_request(&self) -> Option<InteractiveRequest> {
        locked(&self.last_request).clone()
    }

    fn remember(&self, account: &Account) {
        let mut accounts = locked(&self.accounts);
        if !accounts.iter().any(|a| a.id == account.id) {
            accounts.push(account.clone());
        }
    }
}

impl IdentityProvider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    fn storage_namespace(&self) -> &str {
        "mock."
    }

    fn is_embedded_context(&self) -> bool {
        self.embedded
    }

    fn initialize<'a>(&'a self, _config: &'a ProviderConfig) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            bump(&self.calls.initialize);
            match locked(&self.init_error).clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            bump(&self.calls.accounts);
            Ok(locked(&self.accounts).clone())
        })
    }

    fn acquire_token_silent<'a>(
        &'a self,
        account: &'a Account,
        _scopes: &'a [String],
    ) -> BoxFuture<'a, Result<AuthResult>> {
        Box::pin(async move {
            bump(&self.calls.silent);
            if self.silent_gated.swap(false, Ordering::SeqCst) {
                self.silent_gate.notified().await;
            }
            let scripted = locked(&self.silent).pop_front();
            match scripted {
                Some(result) => result,
                None if locked(&self.accounts).is_empty() => {
                    Err(provider_error(codes::NO_ACCOUNT))
                }
                None => Ok(token("at_silent", &account.id, 3600)),
            }
        })
    }

    fn acquire_token_interactive<'a>(
        &'a self,
        request: &'a InteractiveRequest,
    ) -> BoxFuture<'a, Result<AuthResult>> {
        Box::pin(async move {
            bump(&self.calls.interactive);
            *locked(&self.last_request) = Some(request.clone());
            if self.gated.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if request.flow == FlowType::Redirect {
                return std::future::pending().await;
            }
            let scripted = locked(&self.interactive).pop_front();
            let result = scripted.unwrap_or_else(|| Ok(token("at_interactive", "user-1", 3600)));
            if let Ok(result) = &result {
                self.remember(&result.account);
            }
            result
        })
    }

    fn handle_redirect_response(&self) -> BoxFuture<'_, Result<Option<AuthResult>>> {
        Box::pin(async move {
            bump(&self.calls.redirect);
            let pending = locked(&self.redirect).take();
            if let Some(Ok(result)) = &pending {
                self.remember(&result.account);
            }
            pending.transpose()
        })
    }

    fn end_session<'a>(
        &'a self,
        _account: &'a Account,
        _flow: FlowType,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            bump(&self.calls.end_session);
            locked(&self.accounts).clear();
            if self.end_session_gated.swap(false, Ordering::SeqCst) {
                self.end_session_gate.notified().await;
            }
            Ok(())
        })
    }

    fn clear_interaction_state(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            bump(&self.calls.clear_interaction);
            Ok(self.stuck.swap(false, Ordering::SeqCst))
        })
    }
}

/// Memory store that can hold one write to a chosen key until released.
#[derive(Default)]
pub(crate) struct GatedStore {
    inner: MemoryStore,
    gated_key: Mutex<Option<String>>,
    reached: Notify,
    release: Notify,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next write to `key`.
    pub fn gate(&self, key: &str) {
        *locked(&self.gated_key) = Some(key.to_string());
    }

    /// Wait until the held write has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

type StorageResult<T> = std::result::Result<T, StorageError>;

impl KeyValueStore for GatedStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        self.inner.get(key)
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let held = {
                let mut gated = locked(&self.gated_key);
                if gated.as_deref() == Some(key) {
                    *gated = None;
                    true
                } else {
                    false
                }
            };
            if held {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.set(key, value).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        self.inner.keys()
    }
}
