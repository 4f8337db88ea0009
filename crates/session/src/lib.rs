//! Client-side authentication session manager
//!
//! Wraps an `identity::IdentityProvider` and owns the token lifecycle: a cache
//! that stops serving tokens `renewal_lead` before they expire, silent renewal
//! with escalation to interactive login, a single-flight interaction lock,
//! stuck-interaction recovery, and a background renewal timer.
//!
//! Session lifecycle:
//! 1. Host builds one `SessionManager` and calls `initialize(config)` on start
//! 2. A pending redirect login is resumed, a leftover interaction is cleared
//! 3. With an account present, one silent acquisition decides the start state
//! 4. Callers use `get_access_token()`; renewal and escalation are automatic
//! 5. The renewal timer keeps the cache warm until logout or account loss
//!
//! Adapters observe `subscribe()` / `state()` / `status()` and forward the
//! actions `login_interactive`, `logout`, `force_refresh_token` and
//! `clear_authentication_state`.

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod renewal;
pub mod state;

#[cfg(test)]
mod mock;

pub use cache::{CachedToken, TokenCache};
pub use classify::{Classification, classify};
pub use config::{Scopes, SessionConfig};
pub use error::{Error, Result};
pub use lock::{InteractionGuard, InteractionLock};
pub use manager::SessionManager;
pub use state::{Phase, SessionState, StatusSnapshot};

pub use identity::{
    Account, AuthResult, CacheTier, FlowType, IdentityProvider, Prompt, StorageTiers,
};
