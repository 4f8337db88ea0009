//! In-memory token cache
//!
//! Holds at most one bearer token. A cached token is served only while
//! `now < refresh_at`, where `refresh_at = expires_at - renewal_lead`, so
//! callers always receive a token with at least the renewal lead left.
//!
//! Reads take a plain (non-async) mutex for a single check-and-clone: a
//! caller on the fast path never suspends.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use identity::{Account, AuthResult};
use serde::{Deserialize, Serialize};

/// Storage key for the persisted copy of the cached token.
pub const TOKEN_KEY: &str = "session.token";

/// Key prefix owned by the session in both storage tiers.
pub const SESSION_NAMESPACE: &str = "session.";

/// A bearer token with its effective expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub bearer: Secret<String>,
    /// Provider-reported expiry (unix millis)
    pub expires_at: u64,
    /// Effective expiry: `expires_at - renewal_lead` (unix millis)
    pub refresh_at: u64,
    pub account: Account,
}

impl CachedToken {
    pub fn from_result(result: &AuthResult, renewal_lead: Duration) -> Self {
        let lead = renewal_lead.as_millis() as u64;
        Self {
            bearer: result.access_token.clone(),
            expires_at: result.expires_at,
            refresh_at: result.expires_at.saturating_sub(lead),
            account: result.account.clone(),
        }
    }

    pub fn is_fresh_at(&self, now: u64) -> bool {
        now < self.refresh_at
    }

    /// Time left until the effective expiry, zero if already stale.
    pub fn remaining_at(&self, now: u64) -> Duration {
        Duration::from_millis(self.refresh_at.saturating_sub(now))
    }

    pub(crate) fn to_persisted(&self) -> PersistedToken {
        PersistedToken {
            bearer: self.bearer.expose().clone(),
            expires_at: self.expires_at,
            refresh_at: self.refresh_at,
            account: self.account.clone(),
        }
    }
}

/// On-disk form of a `CachedToken` under `TOKEN_KEY`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedToken {
    bearer: String,
    expires_at: u64,
    refresh_at: u64,
    account: Account,
}

impl PersistedToken {
    pub(crate) fn into_cached(self) -> CachedToken {
        CachedToken {
            bearer: Secret::new(self.bearer),
            expires_at: self.expires_at,
            refresh_at: self.refresh_at,
            account: self.account,
        }
    }
}

/// Single-slot token cache.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token if it is still fresh at `now`.
    pub fn fresh(&self, now: u64) -> Option<CachedToken> {
        self.slot()
            .as_ref()
            .filter(|token| token.is_fresh_at(now))
            .cloned()
    }

    /// The cached token regardless of freshness.
    pub fn peek(&self) -> Option<CachedToken> {
        self.slot().clone()
    }

    pub fn store(&self, token: CachedToken) {
        *self.slot() = Some(token);
    }

    /// Drop the cached token. Returns whether one was present.
    pub fn clear(&self) -> bool {
        self.slot().take().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<CachedToken>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
