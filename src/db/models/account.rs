use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};

/// Stable subject identifier (`sub`) of a local account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display, From)]
#[deref(forward)]
#[from(forward)]
pub struct UserId(String);

impl UserId {
    pub fn random() -> Self {
        UserId(uuid::Uuid::new_v4().to_string())
    }
}

/// The slice of a user record the protocol core consumes. The user CRUD
/// service owns the full record; this crate only reads by `sub` and creates
/// accounts during federated first login.
#[derive(Clone, Debug)]
pub struct Account {
    pub uuid: UserId,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
    pub password_hash: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Account {
    pub fn new(name: Option<String>) -> Self {
        Self {
            uuid: UserId::random(),
            name,
            given_name: None,
            family_name: None,
            picture: None,
            password_hash: None,
            created_at: Utc::now().naive_utc(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Email,
    Phone,
}

#[derive(Clone, Debug)]
pub struct UserContact {
    pub contact_id: String,
    pub account_id: UserId,
    pub contact_type: ContactType,
    pub contact_value: String,
    pub verified_at: Option<NaiveDateTime>,
}

impl UserContact {
    pub fn new_email(account_id: UserId, email: &str, verified: bool) -> Self {
        Self {
            contact_id: uuid::Uuid::new_v4().to_string(),
            account_id,
            contact_type: ContactType::Email,
            contact_value: email.to_lowercase(),
            verified_at: verified.then(|| Utc::now().naive_utc()),
        }
    }
}
