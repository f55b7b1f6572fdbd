use chrono::{NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, UserId};
use crate::crypto;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "S256" => Some(CodeChallengeMethod::S256),
            "plain" => Some(CodeChallengeMethod::Plain),
            _ => None,
        }
    }
}

/// A single-use authorization code. The row lives for the code TTL;
/// `consumed_at` is flipped exactly once by the token endpoint, and a second
/// consumption attempt within the TTL window is a detectable replay.
#[derive(Clone, Debug)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: ClientId,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub user_sub: UserId,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub nonce: Option<String>,
    pub auth_time: i64,
    pub consumed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

impl AuthorizationCode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: ClientId,
        redirect_uri: String,
        scopes: Vec<String>,
        user_sub: UserId,
        code_challenge: Option<String>,
        code_challenge_method: Option<CodeChallengeMethod>,
        nonce: Option<String>,
        auth_time: i64,
        ttl: i64,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            // 256 bits, URL-safe
            code: crypto::generate_token(),
            client_id,
            redirect_uri,
            scopes,
            user_sub,
            code_challenge,
            code_challenge_method,
            nonce,
            auth_time,
            consumed_at: None,
            created_at: now,
            expires_at: now + TimeDelta::try_seconds(ttl).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}
