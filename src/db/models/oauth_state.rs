use chrono::{NaiveDateTime, TimeDelta, Utc};

use crate::{crypto, sso::ProviderKind};

/// CSRF state for an in-flight federated login. Single use: the callback
/// consumes the row with a conditional delete, so a replayed `state` finds
/// nothing and the flow aborts.
#[derive(Clone, Debug)]
pub struct OAuthState {
    pub state: String,
    pub provider: ProviderKind,
    pub return_to: String,
    pub code_verifier: Option<String>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl OAuthState {
    pub fn new(provider: ProviderKind, return_to: String, code_verifier: Option<String>, ttl: i64) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            state: crypto::generate_token(),
            provider,
            return_to,
            code_verifier,
            created_at: now,
            expires_at: now + TimeDelta::try_seconds(ttl).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}
