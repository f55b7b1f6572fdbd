use chrono::{NaiveDateTime, Utc};

use super::UserId;
use crate::sso::ProviderKind;

/// Link between an external identity `(provider, provider_sub)` and a local
/// account. Written once at first federated login, then read-only.
#[derive(Clone, Debug)]
pub struct ProviderAccount {
    pub provider: ProviderKind,
    pub provider_sub: String,
    pub account_id: UserId,
    pub contact_id: String,
    pub linked_at: NaiveDateTime,
}

impl ProviderAccount {
    pub fn new(provider: ProviderKind, provider_sub: String, account_id: UserId, contact_id: String) -> Self {
        Self {
            provider,
            provider_sub,
            account_id,
            contact_id,
            linked_at: Utc::now().naive_utc(),
        }
    }
}
