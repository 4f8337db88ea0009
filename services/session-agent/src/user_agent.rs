//! Callback broker: the agent's stand-in for a browser
//!
//! The OAuth provider asks its `UserAgent` to open a popup or navigate. The
//! agent cannot do either, so it publishes the URL (logs, `/session/login`,
//! `/session/status`) and waits for the authority to redirect the user's
//! browser back to `GET /callback`. Callbacks are matched to waiting popups
//! by their `state` parameter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use identity::{BoxFuture, ProviderError, UserAgent, codes};
use reqwest::Url;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

pub struct CallbackBroker {
    waiting: Mutex<HashMap<String, oneshot::Sender<String>>>,
    url_tx: watch::Sender<Option<String>>,
    popup_timeout: Duration,
    embedded: bool,
}

impl CallbackBroker {
    pub fn new(popup_timeout: Duration, embedded: bool) -> Self {
        let (url_tx, _) = watch::channel(None);
        Self {
            waiting: Mutex::new(HashMap::new()),
            url_tx,
            popup_timeout,
            embedded,
        }
    }

    /// The last URL the user was asked to open.
    pub fn current_url(&self) -> Option<String> {
        self.url_tx.borrow().clone()
    }

    /// Observe URLs as the provider publishes them.
    pub fn subscribe_urls(&self) -> watch::Receiver<Option<String>> {
        self.url_tx.subscribe()
    }

    /// Hand a callback query to the popup waiting for its `state`.
    /// Returns false when no popup is waiting for it.
    pub fn deliver(&self, query: &str) -> bool {
        let Some(state) = query_param(query, "state") else {
            return false;
        };
        let Some(waiter) = self.waiting().remove(&state) else {
            return false;
        };
        if waiter.send(query.to_string()).is_err() {
            debug!("login window was already abandoned");
            return false;
        }
        self.url_tx.send_replace(None);
        true
    }

    fn publish(&self, url: &str) {
        self.url_tx.send_replace(Some(url.to_string()));
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<String>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserAgent for CallbackBroker {
    fn open_popup<'a>(&'a self, url: &'a str) -> BoxFuture<'a, identity::Result<String>> {
        Box::pin(async move {
            // Sign-out pages carry no state and send nothing back
            let Some(state) = query_param(url, "state") else {
                info!(url, "open this URL to finish signing out");
                return Ok(String::new());
            };

            let (tx, rx) = oneshot::channel();
            self.waiting().insert(state.clone(), tx);
            self.publish(url);
            info!(url, "open this URL to sign in");

            match tokio::time::timeout(self.popup_timeout, rx).await {
                Ok(Ok(callback)) => Ok(callback),
                Ok(Err(_)) => Err(ProviderError::new(
                    codes::USER_CANCELLED,
                    "login window closed",
                )),
                Err(_) => {
                    self.waiting().remove(&state);
                    self.url_tx.send_replace(None);
                    warn!(
                        timeout_secs = self.popup_timeout.as_secs(),
                        "login window timed out"
                    );
                    Err(ProviderError::new(
                        codes::USER_CANCELLED,
                        "login window timed out",
                    ))
                }
            }
        })
    }

    fn navigate<'a>(&'a self, url: &'a str) -> BoxFuture<'a, identity::Result<()>> {
        Box::pin(async move {
            self.publish(url);
            info!(url, "open this URL to continue");
            Ok(())
        })
    }

    fn is_embedded(&self) -> bool {
        self.embedded
    }
}

/// Read one query parameter from a full URL or a bare query string.
fn query_param(url_or_query: &str, name: &str) -> Option<String> {
    let parsed = if url_or_query.contains("://") {
        Url::parse(url_or_query)
    } else {
        Url::parse(&format!(
            "http://callback.invalid/?{}",
            url_or_query.trim_start_matches('?')
        ))
    }
    .ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LOGIN_URL: &str =
        "https://login.example.com/tenant-1/oauth2/v2.0/authorize?client_id=c&state=abc123";

    fn broker() -> Arc<CallbackBroker> {
        Arc::new(CallbackBroker::new(Duration::from_secs(60), false))
    }

    #[test]
    fn query_param_reads_urls_and_bare_queries() {
        assert_eq!(query_param(LOGIN_URL, "state").as_deref(), Some("abc123"));
        assert_eq!(
            query_param("?code=xyz&state=s%201", "state").as_deref(),
            Some("s 1")
        );
        assert_eq!(query_param("code=xyz", "state"), None);
    }

    #[tokio::test]
    async fn popup_resolves_with_matching_callback() {
        let broker = broker();
        let popup = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.open_popup(LOGIN_URL).await })
        };

        let mut urls = broker.subscribe_urls();
        urls.wait_for(|url| url.is_some()).await.unwrap();
        assert_eq!(broker.current_url().as_deref(), Some(LOGIN_URL));

        assert!(!broker.deliver("code=xyz&state=other"));
        assert!(broker.deliver("code=xyz&state=abc123"));

        let callback = popup.await.unwrap().unwrap();
        assert_eq!(callback, "code=xyz&state=abc123");
        assert!(broker.current_url().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_popup_counts_as_cancelled() {
        let broker = CallbackBroker::new(Duration::from_secs(5), false);
        let err = broker.open_popup(LOGIN_URL).await.unwrap_err();
        assert_eq!(err.code(), codes::USER_CANCELLED);
        assert!(!broker.deliver("code=late&state=abc123"));
    }

    #[tokio::test]
    async fn sign_out_page_needs_no_callback() {
        let broker = broker();
        let result = broker
            .open_popup("https://login.example.com/tenant-1/oauth2/v2.0/logout")
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn navigate_publishes_url() {
        let broker = broker();
        broker.navigate(LOGIN_URL).await.unwrap();
        assert_eq!(broker.current_url().as_deref(), Some(LOGIN_URL));
        assert!(!broker.is_embedded());
    }
}
