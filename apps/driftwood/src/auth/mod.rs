mod error;
mod store;

pub use error::AuthError;
pub use store::{MemoryTokenStore, TokenStore};

use async_trait::async_trait;
use std::sync::Arc;

use crate::model::IdentityState;

/// Server-side issuance of anonymous participation tokens. Implemented by
/// the REST client; mocked in tests.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self, discussion_id: &str) -> Result<String, AuthError>;
}

/// Obtains, caches and invalidates the per-discussion participation token
/// used to sign anonymous submissions.
pub struct ParticipationTokenManager {
    store: Arc<dyn TokenStore>,
    issuer: Arc<dyn TokenIssuer>,
}

impl ParticipationTokenManager {
    pub fn new(store: Arc<dyn TokenStore>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self { store, issuer }
    }

    /// Resolve the token to attach to the next submission.
    ///
    /// Authenticated callers never carry a participation token; any stored
    /// token for the discussion is deleted. Unauthenticated callers reuse
    /// the stored token when present and request a fresh one otherwise.
    /// While identity is still loading nothing is issued or cleared.
    pub async fn ensure_token(
        &self,
        discussion_id: &str,
        identity: IdentityState,
    ) -> Result<Option<String>, AuthError> {
        match identity {
            IdentityState::Authenticated => {
                self.store.delete(discussion_id);
                Ok(None)
            }
            IdentityState::Loading => Ok(self.store.get(discussion_id)),
            IdentityState::Unauthenticated => {
                if let Some(token) = self.store.get(discussion_id) {
                    return Ok(Some(token));
                }
                match self.issuer.issue_token(discussion_id).await {
                    Ok(token) => {
                        self.store.set(discussion_id, &token);
                        Ok(Some(token))
                    }
                    Err(err) => {
                        // A stale token would only earn another 401.
                        self.store.delete(discussion_id);
                        tracing::warn!(
                            target = "driftwood::auth",
                            discussion_id,
                            error = %err,
                            "participation token issuance failed"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Drop the held token after the server rejected it (401).
    pub fn invalidate(&self, discussion_id: &str) {
        self.store.delete(discussion_id);
    }

    pub fn held_token(&self, discussion_id: &str) -> Option<String> {
        self.store.get(discussion_id)
    }
}
