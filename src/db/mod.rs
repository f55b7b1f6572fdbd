//
// Persistence port
//
// The wide-column store behind the real deployment is an external
// collaborator; the core only talks to these narrow repository traits. The
// contract every backend must honor: per-row TTL, `INSERT IF NOT EXISTS` and
// conditional update/delete primitives that report whether they applied.
// Code consumption, refresh rotation and oauth_state consumption ride on
// those applied booleans and are never retried.
mod memory;
pub mod models;

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::api::ApiResult;
use crate::sso::ProviderKind;
use self::models::{
    AuthorizationCode, Client, ClientId, OAuthState, ProviderAccount, RefreshTokenRecord, SigningKeyRecord, UserId,
};

pub use self::memory::MemStore;

/// Outcome of the one-shot authorization-code consumption.
#[derive(Debug)]
pub enum CodeConsume {
    /// This call won the row; tokens may be issued.
    Applied(AuthorizationCode),
    /// The row exists but was consumed before; the caller must treat this as
    /// a replay and invalidate whatever the first consumption produced.
    Replayed(AuthorizationCode),
    /// Unknown or expired code.
    Missing,
}

#[rocket::async_trait]
pub trait ClientRepo: Send + Sync {
    async fn insert_if_absent(&self, client: &Client) -> ApiResult<bool>;
    async fn get(&self, id: &ClientId) -> ApiResult<Option<Client>>;
    /// Full-row replace; applied=false when the row is gone.
    async fn replace(&self, client: &Client) -> ApiResult<bool>;
    async fn list(&self) -> ApiResult<Vec<Client>>;
}

#[rocket::async_trait]
pub trait AuthCodeRepo: Send + Sync {
    async fn insert(&self, code: &AuthorizationCode) -> ApiResult<()>;
    /// Linearizable per code value: of any number of concurrent calls for the
    /// same code, exactly one observes `Applied`.
    async fn consume(&self, code: &str) -> ApiResult<CodeConsume>;
    async fn purge_expired(&self) -> ApiResult<usize>;
}

#[rocket::async_trait]
pub trait RefreshTokenRepo: Send + Sync {
    async fn insert(&self, record: &RefreshTokenRecord) -> ApiResult<()>;
    async fn get(&self, token_hash: &str) -> ApiResult<Option<RefreshTokenRecord>>;
    /// Compare-and-set `revoked = true` iff currently active. applied=false
    /// means a concurrent rotation got there first (replay signal).
    async fn revoke_if_active(&self, token_hash: &str) -> ApiResult<bool>;
    /// Replay response: revoke every live token of the pair issued at or
    /// after the given instant. Returns how many were revoked.
    async fn revoke_issued_since(
        &self,
        client_id: &ClientId,
        user_sub: &UserId,
        issued_at: NaiveDateTime,
    ) -> ApiResult<usize>;
    async fn purge_expired(&self) -> ApiResult<usize>;
}

#[rocket::async_trait]
pub trait OAuthStateRepo: Send + Sync {
    async fn insert(&self, state: &OAuthState) -> ApiResult<()>;
    /// Conditional delete; `None` for unknown, expired or already-consumed
    /// state (the federation callback aborts on all three).
    async fn consume(&self, state: &str) -> ApiResult<Option<OAuthState>>;
    async fn purge_expired(&self) -> ApiResult<usize>;
}

#[rocket::async_trait]
pub trait SigningKeyRepo: Send + Sync {
    async fn insert(&self, key: &SigningKeyRecord) -> ApiResult<()>;
    async fn list(&self) -> ApiResult<Vec<SigningKeyRecord>>;
    async fn mark_retired(&self, kid: &str, at: NaiveDateTime) -> ApiResult<bool>;
}

#[rocket::async_trait]
pub trait ProviderAccountRepo: Send + Sync {
    async fn get(&self, provider: ProviderKind, provider_sub: &str) -> ApiResult<Option<ProviderAccount>>;
    async fn insert_if_absent(&self, link: &ProviderAccount) -> ApiResult<bool>;
}

/// The bundle of repositories handed to the services at composition time.
#[derive(Clone)]
pub struct Repositories {
    pub clients: Arc<dyn ClientRepo>,
    pub auth_codes: Arc<dyn AuthCodeRepo>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepo>,
    pub oauth_state: Arc<dyn OAuthStateRepo>,
    pub signing_keys: Arc<dyn SigningKeyRepo>,
    pub provider_accounts: Arc<dyn ProviderAccountRepo>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemStore::default());
        Repositories {
            clients: store.clone(),
            auth_codes: store.clone(),
            refresh_tokens: store.clone(),
            oauth_state: store.clone(),
            signing_keys: store.clone(),
            provider_accounts: store,
        }
    }
}
