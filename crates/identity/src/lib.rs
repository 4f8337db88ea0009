//! Identity provider capability for the session manager
//!
//! Defines the `IdentityProvider` trait that decouples the session state
//! machine from the OAuth2/OIDC protocol machinery. The session core only
//! ever talks to this trait; `OAuthProvider` is the bundled implementation
//! (authorization code + PKCE, refresh-token silent renewal).
//!
//! Provider flow:
//! 1. `initialize()` validates endpoints for a `ProviderConfig`
//! 2. `handle_redirect_response()` resumes a redirect login after navigation
//! 3. `accounts()` lists signed-in accounts from the storage tier
//! 4. `acquire_token_silent()` renews a token without user interaction
//! 5. `acquire_token_interactive()` signs the user in via popup or redirect
//! 6. `end_session()` signs the account out

pub mod error;
pub mod oauth;
pub mod pkce;
pub mod storage;
pub mod token;
pub mod types;

pub use error::{ProviderError, Result, StorageError, codes};
pub use oauth::{OAuthProvider, UserAgent};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageTiers};
pub use types::{
    Account, AuthResult, CacheTier, FlowType, InteractiveRequest, Prompt, ProviderConfig,
    ProviderIdentity, now_millis,
};

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Low-level identity provider (the OAuth SDK the session manager wraps).
///
/// All failures are reported as `ProviderError` carrying a protocol error
/// code; the session layer reclassifies those codes into its own taxonomy.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn IdentityProvider>`).
pub trait IdentityProvider: Send + Sync {
    /// Identifier for logging (e.g. "oauth", "mock")
    fn id(&self) -> &str;

    /// Key prefix the provider reserves in both storage tiers. Swept on a
    /// full authentication reset.
    fn storage_namespace(&self) -> &str;

    /// Whether the host runs this session inside an embedded frame. Read once
    /// when the session manager is built.
    fn is_embedded_context(&self) -> bool {
        false
    }

    /// Construct the provider connection for the given configuration.
    fn initialize<'a>(&'a self, config: &'a ProviderConfig) -> BoxFuture<'a, Result<()>>;

    /// Accounts currently signed in, in a stable order. Possibly empty.
    fn accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>>;

    /// Renew a token for `account` without user interaction.
    fn acquire_token_silent<'a>(
        &'a self,
        account: &'a Account,
        scopes: &'a [String],
    ) -> BoxFuture<'a, Result<AuthResult>>;

    /// Sign the user in interactively.
    ///
    /// For `FlowType::Redirect` the returned future never resolves: the host
    /// navigates away and the result arrives through
    /// `handle_redirect_response` on the next start.
    fn acquire_token_interactive<'a>(
        &'a self,
        request: &'a InteractiveRequest,
    ) -> BoxFuture<'a, Result<AuthResult>>;

    /// Consume a redirect response left by a previous navigation, if any.
    fn handle_redirect_response(&self) -> BoxFuture<'_, Result<Option<AuthResult>>>;

    /// End the provider-side session for `account`.
    fn end_session<'a>(&'a self, account: &'a Account, flow: FlowType)
    -> BoxFuture<'a, Result<()>>;

    /// Discard a provider-level "interaction in progress" marker.
    /// Returns whether one was present.
    fn clear_interaction_state(&self) -> BoxFuture<'_, Result<bool>>;
}
