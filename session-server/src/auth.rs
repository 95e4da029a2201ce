//! Contract to the external account service. The HTTP service itself
//! lives outside this process; the server only ever asks "who is behind
//! this connection". Lookups are idempotent, so the result is cached on
//! the connection after the first answer.

use async_trait::async_trait;

/// An authenticated account as the external service reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub display_name: String,
    /// Cosmetic ids the account owns beyond the free set.
    pub owned_cosmetics: Vec<u32>,
}

impl User {
    pub fn owns_cosmetic(&self, id: u32) -> bool {
        self.owned_cosmetics.contains(&id)
    }
}

/// Resolves a transport connection to an account, or `None` for guests.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn connection_user(&self, client_id: u32, username: &str) -> Option<User>;
}

/// Default backend: everyone is a guest.
pub struct NullAuth;

#[async_trait]
impl AuthApi for NullAuth {
    async fn connection_user(&self, _client_id: u32, _username: &str) -> Option<User> {
        None
    }
}
