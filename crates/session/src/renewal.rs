//! Background token renewal
//!
//! While a session is authenticated, a background task runs silent
//! acquisition so the cache is refreshed before callers need a token. Each
//! wake-up is scheduled no later than the cached token's effective expiry,
//! so a token is never published past `expires_at - renewal_lead`.
//!
//! The task holds only a `Weak` reference to the manager: dropping the last
//! `Arc` ends it, and the manager aborts it on logout, reset and re-arm.

use std::sync::Weak;
use std::time::Duration;

use identity::now_millis;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CachedToken;
use crate::manager::SessionManager;
use crate::metrics;

/// Shortest wait between cycles once the cached token is already stale.
pub const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(30);

/// Delay until the next cycle: the configured interval, cut short at the
/// cached token's effective expiry. A stale token waits `MIN_RENEWAL_INTERVAL`.
pub fn effective_interval(configured: Duration, token: Option<&CachedToken>, now: u64) -> Duration {
    let period = configured.max(MIN_RENEWAL_INTERVAL);
    match token.map(|t| t.remaining_at(now)) {
        Some(remaining) if remaining.is_zero() => MIN_RENEWAL_INTERVAL,
        Some(remaining) => period.min(remaining),
        None => period,
    }
}

/// Spawn the renewal timer for `manager`.
pub(crate) fn spawn_renewal_task(
    manager: Weak<SessionManager>,
    configured: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                effective_interval(configured, manager.cached_token().as_ref(), now_millis())
            };
            tokio::time::sleep(delay).await;

            let Some(manager) = manager.upgrade() else {
                debug!("session manager dropped, renewal task exiting");
                return;
            };
            if !renewal_cycle(&manager).await {
                return;
            }
        }
    })
}

/// Run one renewal cycle. Returns false when the timer should stop.
///
/// Renewal failures are logged and swallowed; the next cycle retries and
/// foreground callers escalate on their own.
pub(crate) async fn renewal_cycle(manager: &SessionManager) -> bool {
    if !manager.is_ready() {
        debug!("session no longer initialized, renewal task exiting");
        return false;
    }
    // Drop a bearer that went stale since the last transition
    manager.publish();

    let accounts = match manager.provider().accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "failed to list accounts during renewal, will retry next cycle");
            metrics::record_renewal_cycle("error");
            return true;
        }
    };

    if accounts.is_empty() {
        info!("signed-in account is gone, stopping renewal");
        metrics::record_renewal_cycle("account_lost");
        manager.account_lost().await;
        return false;
    }

    match manager.acquire_silent().await {
        Ok(_) => {
            debug!("background renewal succeeded");
            metrics::record_renewal_cycle("ok");
        }
        Err(e) => {
            warn!(error = %e, "background renewal failed, will retry next cycle");
            metrics::record_renewal_cycle("error");
        }
    }
    true
}
