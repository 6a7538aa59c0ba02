//! Connect-time authentication seam.
//!
//! Login happens over HTTP before a client ever opens the presence socket,
//! so the default [`TrustClaim`] registers whatever identity the client
//! presents. Deployments that want the socket itself to check the session
//! plug in a stricter [`Authenticator`] such as [`SessionTable`].

use std::collections::HashMap;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use parley_protocol::presence::UserId;

use crate::lifecycle::IdentityClaim;

/// A boxed future returned by [`Authenticator::authenticate`].
///
/// Resolves to the identity to register, or `None` for an anonymous
/// connection that only listens to presence.
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<UserId>, AuthError>> + Send + 'a>>;

/// Decides which identity a new connection is registered under.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate<'a>(&'a self, claim: &'a IdentityClaim) -> AuthFuture<'a>;
}

/// Reasons a connection is rejected at connect time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,

    #[error("invalid session token")]
    InvalidToken,

    #[error("session does not belong to {0}")]
    IdentityMismatch(UserId),

    #[error("authentication timed out")]
    Timeout,

    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Registers the claimed identity without checking a credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustClaim;

impl Authenticator for TrustClaim {
    fn authenticate<'a>(&'a self, claim: &'a IdentityClaim) -> AuthFuture<'a> {
        Box::pin(future::ready(Ok::<_, AuthError>(claim.user_id.clone())))
    }
}

/// In-memory token → identity table.
///
/// The connection must present a known token; the identity it is
/// registered under comes from the table, and a conflicting `userId` claim
/// is rejected.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, UserId>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session issued by the login flow.
    pub fn insert(&self, token: impl Into<String>, user: UserId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), user);
    }

    /// Forgets a session (logout, expiry). Returns `true` if it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    fn resolve(&self, claim: &IdentityClaim) -> Result<Option<UserId>, AuthError> {
        let token = claim.token.as_deref().ok_or(AuthError::MissingToken)?;
        let owner = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)?;

        match &claim.user_id {
            Some(claimed) if *claimed != owner => Err(AuthError::IdentityMismatch(claimed.clone())),
            _ => Ok(Some(owner)),
        }
    }
}

impl Authenticator for SessionTable {
    fn authenticate<'a>(&'a self, claim: &'a IdentityClaim) -> AuthFuture<'a> {
        Box::pin(future::ready(self.resolve(claim)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(user: Option<&str>, token: Option<&str>) -> IdentityClaim {
        IdentityClaim {
            user_id: user.map(UserId::from),
            token: token.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn trust_claim_passes_identity_through() {
        let auth = TrustClaim;
        let id = auth.authenticate(&claim(Some("u1"), None)).await.unwrap();
        assert_eq!(id, Some(UserId::from("u1")));

        let anon = auth.authenticate(&claim(None, None)).await.unwrap();
        assert_eq!(anon, None);
    }

    #[tokio::test]
    async fn session_table_resolves_token_owner() {
        let table = SessionTable::new();
        table.insert("t-1", UserId::from("u1"));

        let id = table.authenticate(&claim(Some("u1"), Some("t-1"))).await;
        assert_eq!(id, Ok(Some(UserId::from("u1"))));

        // The claim may be omitted; the token decides.
        let id = table.authenticate(&claim(None, Some("t-1"))).await;
        assert_eq!(id, Ok(Some(UserId::from("u1"))));
    }

    #[tokio::test]
    async fn session_table_rejects_bad_credentials() {
        let table = SessionTable::new();
        table.insert("t-1", UserId::from("u1"));

        assert_eq!(
            table.authenticate(&claim(Some("u1"), None)).await,
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            table.authenticate(&claim(Some("u1"), Some("nope"))).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            table.authenticate(&claim(Some("u2"), Some("t-1"))).await,
            Err(AuthError::IdentityMismatch(UserId::from("u2")))
        );
    }

    #[tokio::test]
    async fn revoked_session_is_rejected() {
        let table = SessionTable::new();
        table.insert("t-1", UserId::from("u1"));
        assert!(table.revoke("t-1"));
        assert!(!table.revoke("t-1"));
        assert_eq!(
            table.authenticate(&claim(Some("u1"), Some("t-1"))).await,
            Err(AuthError::InvalidToken)
        );
    }
}
