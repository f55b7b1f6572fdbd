//
// In-process repository backend
//
// Mutex-guarded maps with the same conditional-write semantics the
// wide-column deployment gets from lightweight transactions. Lock scopes
// never contain an await, so every consume/revoke below is linearizable per
// key. This backend serves the default standalone deployment and the tests.
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};

use super::{
    models::{
        AuthorizationCode, Client, ClientId, OAuthState, ProviderAccount, RefreshTokenRecord, SigningKeyRecord,
        UserId,
    },
    AuthCodeRepo, ClientRepo, CodeConsume, OAuthStateRepo, ProviderAccountRepo, RefreshTokenRepo, SigningKeyRepo,
};
use crate::api::ApiResult;
use crate::sso::ProviderKind;

#[derive(Default)]
pub struct MemStore {
    clients: Mutex<HashMap<String, Client>>,
    auth_codes: Mutex<HashMap<String, AuthorizationCode>>,
    refresh_tokens: Mutex<HashMap<String, RefreshTokenRecord>>,
    oauth_state: Mutex<HashMap<String, OAuthState>>,
    signing_keys: Mutex<HashMap<String, SigningKeyRecord>>,
    provider_accounts: Mutex<HashMap<(ProviderKind, String), ProviderAccount>>,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[rocket::async_trait]
impl ClientRepo for MemStore {
    async fn insert_if_absent(&self, client: &Client) -> ApiResult<bool> {
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(&*client.uuid) {
            return Ok(false);
        }
        clients.insert(client.uuid.to_string(), client.clone());
        Ok(true)
    }

    async fn get(&self, id: &ClientId) -> ApiResult<Option<Client>> {
        Ok(self.clients.lock().unwrap().get(&**id).cloned())
    }

    async fn replace(&self, client: &Client) -> ApiResult<bool> {
        let mut clients = self.clients.lock().unwrap();
        match clients.get_mut(&*client.uuid) {
            Some(existing) => {
                *existing = client.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> ApiResult<Vec<Client>> {
        Ok(self.clients.lock().unwrap().values().cloned().collect())
    }
}

#[rocket::async_trait]
impl AuthCodeRepo for MemStore {
    async fn insert(&self, code: &AuthorizationCode) -> ApiResult<()> {
        self.auth_codes.lock().unwrap().insert(code.code.clone(), code.clone());
        Ok(())
    }

    async fn consume(&self, code: &str) -> ApiResult<CodeConsume> {
        let mut codes = self.auth_codes.lock().unwrap();
        let Some(row) = codes.get_mut(code) else {
            return Ok(CodeConsume::Missing);
        };
        if row.is_expired(now()) {
            codes.remove(code);
            return Ok(CodeConsume::Missing);
        }
        if row.consumed_at.is_some() {
            return Ok(CodeConsume::Replayed(row.clone()));
        }
        row.consumed_at = Some(now());
        Ok(CodeConsume::Applied(row.clone()))
    }

    async fn purge_expired(&self) -> ApiResult<usize> {
        let mut codes = self.auth_codes.lock().unwrap();
        let before = codes.len();
        let cutoff = now();
        codes.retain(|_, row| !row.is_expired(cutoff));
        Ok(before - codes.len())
    }
}

#[rocket::async_trait]
impl RefreshTokenRepo for MemStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> ApiResult<()> {
        self.refresh_tokens.lock().unwrap().insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, token_hash: &str) -> ApiResult<Option<RefreshTokenRecord>> {
        let tokens = self.refresh_tokens.lock().unwrap();
        Ok(tokens.get(token_hash).filter(|row| !row.is_expired(now())).cloned())
    }

    async fn revoke_if_active(&self, token_hash: &str) -> ApiResult<bool> {
        let mut tokens = self.refresh_tokens.lock().unwrap();
        match tokens.get_mut(token_hash) {
            Some(row) if !row.revoked && !row.is_expired(now()) => {
                row.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_issued_since(
        &self,
        client_id: &ClientId,
        user_sub: &UserId,
        issued_at: NaiveDateTime,
    ) -> ApiResult<usize> {
        let mut tokens = self.refresh_tokens.lock().unwrap();
        let mut revoked = 0;
        for row in tokens.values_mut() {
            if !row.revoked && row.client_id == *client_id && row.user_sub == *user_sub && row.issued_at >= issued_at
            {
                row.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self) -> ApiResult<usize> {
        let mut tokens = self.refresh_tokens.lock().unwrap();
        let before = tokens.len();
        let cutoff = now();
        tokens.retain(|_, row| !row.is_expired(cutoff));
        Ok(before - tokens.len())
    }
}

#[rocket::async_trait]
impl OAuthStateRepo for MemStore {
    async fn insert(&self, state: &OAuthState) -> ApiResult<()> {
        self.oauth_state.lock().unwrap().insert(state.state.clone(), state.clone());
        Ok(())
    }

    async fn consume(&self, state: &str) -> ApiResult<Option<OAuthState>> {
        let mut rows = self.oauth_state.lock().unwrap();
        match rows.remove(state) {
            Some(row) if !row.is_expired(now()) => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    async fn purge_expired(&self) -> ApiResult<usize> {
        let mut rows = self.oauth_state.lock().unwrap();
        let before = rows.len();
        let cutoff = now();
        rows.retain(|_, row| !row.is_expired(cutoff));
        Ok(before - rows.len())
    }
}

#[rocket::async_trait]
impl SigningKeyRepo for MemStore {
    async fn insert(&self, key: &SigningKeyRecord) -> ApiResult<()> {
        self.signing_keys.lock().unwrap().insert(key.kid.clone(), key.clone());
        Ok(())
    }

    async fn list(&self) -> ApiResult<Vec<SigningKeyRecord>> {
        Ok(self.signing_keys.lock().unwrap().values().cloned().collect())
    }

    async fn mark_retired(&self, kid: &str, at: NaiveDateTime) -> ApiResult<bool> {
        let mut keys = self.signing_keys.lock().unwrap();
        match keys.get_mut(kid) {
            Some(row) if row.retired_at.is_none() => {
                row.retired_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[rocket::async_trait]
impl ProviderAccountRepo for MemStore {
    async fn get(&self, provider: ProviderKind, provider_sub: &str) -> ApiResult<Option<ProviderAccount>> {
        let links = self.provider_accounts.lock().unwrap();
        Ok(links.get(&(provider, provider_sub.to_string())).cloned())
    }

    async fn insert_if_absent(&self, link: &ProviderAccount) -> ApiResult<bool> {
        let mut links = self.provider_accounts.lock().unwrap();
        let key = (link.provider, link.provider_sub.clone());
        if links.contains_key(&key) {
            return Ok(false);
        }
        links.insert(key, link.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GrantType, ResponseType, TokenEndpointAuthMethod};

    fn test_code(ttl: i64) -> AuthorizationCode {
        AuthorizationCode::new(
            ClientId::random(),
            "https://rp.example.com/cb".to_string(),
            vec!["openid".to_string()],
            UserId::random(),
            None,
            None,
            None,
            Utc::now().timestamp(),
            ttl,
        )
    }

    #[rocket::async_test]
    async fn auth_code_is_single_use() {
        let store = MemStore::default();
        let code = test_code(60);
        AuthCodeRepo::insert(&store, &code).await.unwrap();

        assert!(matches!(AuthCodeRepo::consume(&store, &code.code).await.unwrap(), CodeConsume::Applied(_)));
        assert!(matches!(AuthCodeRepo::consume(&store, &code.code).await.unwrap(), CodeConsume::Replayed(_)));
        assert!(matches!(AuthCodeRepo::consume(&store, "nonexistent").await.unwrap(), CodeConsume::Missing));
    }

    #[rocket::async_test]
    async fn expired_auth_code_is_missing() {
        let store = MemStore::default();
        let code = test_code(-1);
        AuthCodeRepo::insert(&store, &code).await.unwrap();

        assert!(matches!(AuthCodeRepo::consume(&store, &code.code).await.unwrap(), CodeConsume::Missing));
    }

    #[rocket::async_test]
    async fn concurrent_code_exchange_applies_exactly_once() {
        use std::sync::Arc;

        let store = Arc::new(MemStore::default());
        let code = test_code(60);
        AuthCodeRepo::insert(&*store, &code).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let value = code.code.clone();
                tokio::spawn(async move { AuthCodeRepo::consume(&*store, &value).await.unwrap() })
            })
            .collect();

        let outcomes = futures::future::join_all(tasks).await;
        let applied =
            outcomes.iter().filter(|res| matches!(res.as_ref().unwrap(), CodeConsume::Applied(_))).count();
        assert_eq!(applied, 1);
    }

    #[rocket::async_test]
    async fn oauth_state_consume_is_conditional_delete() {
        let store = MemStore::default();
        let state = OAuthState::new(ProviderKind::Google, "/".to_string(), None, 600);
        OAuthStateRepo::insert(&store, &state).await.unwrap();

        assert!(OAuthStateRepo::consume(&store, &state.state).await.unwrap().is_some());
        assert!(OAuthStateRepo::consume(&store, &state.state).await.unwrap().is_none());
    }

    #[rocket::async_test]
    async fn refresh_revocation_is_compare_and_set() {
        let store = MemStore::default();
        let (_, record) = RefreshTokenRecord::mint(
            ClientId::random(),
            UserId::random(),
            vec!["openid".to_string()],
            Utc::now().timestamp(),
            3600,
        );
        RefreshTokenRepo::insert(&store, &record).await.unwrap();

        assert!(store.revoke_if_active(&record.token_hash).await.unwrap());
        assert!(!store.revoke_if_active(&record.token_hash).await.unwrap());
    }

    #[rocket::async_test]
    async fn revoke_issued_since_only_hits_the_live_chain() {
        let store = MemStore::default();
        let client_id = ClientId::random();
        let user_sub = UserId::random();
        let base = Utc::now().naive_utc();

        let (_, mut old) = RefreshTokenRecord::mint(
            client_id.clone(),
            user_sub.clone(),
            vec!["openid".to_string()],
            0,
            3600,
        );
        old.issued_at = base - chrono::TimeDelta::try_seconds(120).unwrap();
        let (_, descendant) = RefreshTokenRecord::mint(
            client_id.clone(),
            user_sub.clone(),
            vec!["openid".to_string()],
            0,
            3600,
        );
        let (_, other_client) = RefreshTokenRecord::mint(
            ClientId::random(),
            user_sub.clone(),
            vec!["openid".to_string()],
            0,
            3600,
        );
        for record in [&old, &descendant, &other_client] {
            RefreshTokenRepo::insert(&store, record).await.unwrap();
        }

        let revoked = store
            .revoke_issued_since(&client_id, &user_sub, base - chrono::TimeDelta::try_seconds(60).unwrap())
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(!RefreshTokenRepo::get(&store, &old.token_hash).await.unwrap().unwrap().revoked);
        assert!(RefreshTokenRepo::get(&store, &descendant.token_hash).await.unwrap().unwrap().revoked);
        assert!(!RefreshTokenRepo::get(&store, &other_client.token_hash).await.unwrap().unwrap().revoked);
    }

    #[rocket::async_test]
    async fn inactive_clients_still_round_trip_through_replace() {
        let store = MemStore::default();
        let mut client = Client::new(
            "Test RP".to_string(),
            vec!["https://rp.example.com/cb".to_string()],
            vec![GrantType::AuthorizationCode],
            vec![ResponseType::Code],
            vec!["openid".to_string()],
            TokenEndpointAuthMethod::ClientSecretBasic,
            Some("hash".to_string()),
        );
        assert!(ClientRepo::insert_if_absent(&store, &client).await.unwrap());
        assert!(!ClientRepo::insert_if_absent(&store, &client).await.unwrap());

        client.is_active = false;
        assert!(store.replace(&client).await.unwrap());
        assert!(!ClientRepo::get(&store, &client.uuid).await.unwrap().unwrap().is_active);
    }
}
