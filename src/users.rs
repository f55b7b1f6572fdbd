//
// UserStore port
//
// Accounts and contact methods are owned by the external user CRUD service;
// this is the narrow surface the protocol core needs from it: read by `sub`,
// find by email, verify a password, and create an account on first federated
// login. The in-memory implementation backs the standalone server and tests.
use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Map, Value};

use crate::{
    api::ApiResult,
    crypto,
    db::models::{Account, UserContact, UserId},
};

#[rocket::async_trait]
pub trait UserStore: Send + Sync {
    async fn get_account(&self, sub: &UserId) -> ApiResult<Option<Account>>;
    async fn find_account_by_email(&self, email: &str) -> ApiResult<Option<(Account, UserContact)>>;
    /// Credential check. Must take the same time whether or not the account
    /// exists; the caller's response is identical either way.
    async fn verify_password(&self, email: &str, password: &str) -> ApiResult<Option<Account>>;
    async fn create_account_with_email(&self, email: &str, verified: bool, profile: Profile)
        -> ApiResult<(Account, UserContact)>;
    async fn email_contact(&self, sub: &UserId) -> ApiResult<Option<UserContact>>;
}

/// Optional profile attributes carried over from a federated provider.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

/// The OIDC standard claims unlocked by `profile` and `email` scopes, used by
/// both ID-token issuance and the userinfo endpoint.
pub fn profile_claims(account: &Account, contact: Option<&UserContact>, scopes: &[String]) -> Map<String, Value> {
    let mut claims = Map::new();

    if scopes.iter().any(|s| s == "profile") {
        if let Some(name) = &account.name {
            claims.insert("name".into(), json!(name));
        }
        if let Some(given_name) = &account.given_name {
            claims.insert("given_name".into(), json!(given_name));
        }
        if let Some(family_name) = &account.family_name {
            claims.insert("family_name".into(), json!(family_name));
        }
        if let Some(picture) = &account.picture {
            claims.insert("picture".into(), json!(picture));
        }
    }

    if scopes.iter().any(|s| s == "email") {
        if let Some(contact) = contact {
            claims.insert("email".into(), json!(contact.contact_value));
            claims.insert("email_verified".into(), json!(contact.verified_at.is_some()));
        }
    }

    claims
}

#[derive(Default)]
pub struct InMemoryUserStore {
    accounts: Mutex<HashMap<String, Account>>,
    contacts: Mutex<HashMap<String, UserContact>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a password-capable account, for bootstrap and tests.
    pub fn seed_account(&self, email: &str, password: &str, name: &str) -> UserId {
        let mut account = Account::new(Some(name.to_string()));
        account.password_hash = Some(crypto::hash_password(password));
        let sub = account.uuid.clone();

        let contact = UserContact::new_email(sub.clone(), email, true);
        self.accounts.lock().unwrap().insert(sub.to_string(), account);
        self.contacts.lock().unwrap().insert(contact.contact_id.clone(), contact);

        sub
    }
}

#[rocket::async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_account(&self, sub: &UserId) -> ApiResult<Option<Account>> {
        Ok(self.accounts.lock().unwrap().get(&**sub).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> ApiResult<Option<(Account, UserContact)>> {
        let email = email.to_lowercase();
        let contacts = self.contacts.lock().unwrap();
        let Some(contact) = contacts.values().find(|c| c.contact_value == email) else {
            return Ok(None);
        };
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts.get(&*contact.account_id).map(|account| (account.clone(), contact.clone())))
    }

    async fn verify_password(&self, email: &str, password: &str) -> ApiResult<Option<Account>> {
        // Burn a hash verification even for unknown emails so response timing
        // does not leak whether the contact exists.
        const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$GpZ3sK/oH9p7VIiLuRqUWPTBlkK0bmdzdWeUiVzhEWY";

        match self.find_account_by_email(email).await? {
            Some((account, _)) => match &account.password_hash {
                Some(hash) if crypto::verify_password(password, hash) => Ok(Some(account)),
                _ => Ok(None),
            },
            None => {
                crypto::verify_password(password, DUMMY_HASH);
                Ok(None)
            }
        }
    }

    async fn create_account_with_email(
        &self,
        email: &str,
        verified: bool,
        profile: Profile,
    ) -> ApiResult<(Account, UserContact)> {
        let mut account = Account::new(profile.name);
        account.given_name = profile.given_name;
        account.family_name = profile.family_name;
        account.picture = profile.picture;

        let contact = UserContact::new_email(account.uuid.clone(), email, verified);
        self.accounts.lock().unwrap().insert(account.uuid.to_string(), account.clone());
        self.contacts.lock().unwrap().insert(contact.contact_id.clone(), contact.clone());

        Ok((account, contact))
    }

    async fn email_contact(&self, sub: &UserId) -> ApiResult<Option<UserContact>> {
        let contacts = self.contacts.lock().unwrap();
        Ok(contacts.values().find(|c| c.account_id == *sub).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rocket::async_test]
    async fn password_verification_and_lookup() {
        let store = InMemoryUserStore::new();
        let sub = store.seed_account("alice@example.com", "correct horse", "Alice Example");

        assert!(store.verify_password("alice@example.com", "correct horse").await.unwrap().is_some());
        assert!(store.verify_password("alice@example.com", "wrong").await.unwrap().is_none());
        assert!(store.verify_password("nobody@example.com", "whatever").await.unwrap().is_none());

        let (account, contact) = store.find_account_by_email("ALICE@example.com").await.unwrap().unwrap();
        assert_eq!(account.uuid, sub);
        assert!(contact.verified_at.is_some());
    }

    #[rocket::async_test]
    async fn claims_follow_scopes() {
        let store = InMemoryUserStore::new();
        let sub = store.seed_account("bob@example.com", "pw", "Bob");
        let account = store.get_account(&sub).await.unwrap().unwrap();
        let contact = store.email_contact(&sub).await.unwrap();

        let all = profile_claims(&account, contact.as_ref(), &["profile".to_string(), "email".to_string()]);
        assert_eq!(all["name"], json!("Bob"));
        assert_eq!(all["email"], json!("bob@example.com"));
        assert_eq!(all["email_verified"], json!(true));

        let none = profile_claims(&account, contact.as_ref(), &["openid".to_string()]);
        assert!(none.is_empty());
    }
}
