use chrono::{NaiveDateTime, TimeDelta, Utc};

use super::{ClientId, UserId};
use crate::crypto;

/// One opaque refresh token. Only the SHA-256 hash of the handed-out value is
/// stored; rotation inserts a successor row and revokes this one atomically.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub client_id: ClientId,
    pub user_sub: UserId,
    pub scopes: Vec<String>,
    pub auth_time: i64,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked: bool,
}

impl RefreshTokenRecord {
    /// Mints a fresh opaque token, returning `(plaintext, record)`. The
    /// plaintext leaves the process exactly once, in the token response.
    pub fn mint(
        client_id: ClientId,
        user_sub: UserId,
        scopes: Vec<String>,
        auth_time: i64,
        ttl: i64,
    ) -> (String, Self) {
        let token = crypto::generate_token();
        let now = Utc::now().naive_utc();

        let record = Self {
            token_hash: crypto::sha256_hex(token.as_bytes()),
            client_id,
            user_sub,
            scopes,
            auth_time,
            issued_at: now,
            expires_at: now + TimeDelta::try_seconds(ttl).unwrap_or_default(),
            revoked: false,
        };

        (token, record)
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}
