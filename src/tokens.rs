//
// Token service
//
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    api::ApiResult,
    config::Config,
    crypto,
    db::{
        models::{Client, GrantType, RefreshTokenRecord, UserId},
        RefreshTokenRepo,
    },
    jose::{self, Alg, Jws},
    keys::{KeyManager, SigningKey},
    users::{profile_claims, UserStore},
    util::security_event,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    // Issuer
    pub iss: String,
    // Subject (user UUID, or the client id for client_credentials)
    pub sub: String,
    // Audience
    pub aud: String,
    // Space-joined granted scopes
    pub scope: String,
    pub client_id: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub auth_time: i64,
}

#[derive(Debug)]
pub struct IssuedTokens {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: String,
}

impl IssuedTokens {
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "access_token": self.access_token,
            "token_type": "Bearer",
            "expires_in": self.expires_in,
            "scope": self.scope,
        });
        if let Some(id_token) = &self.id_token {
            body["id_token"] = json!(id_token);
        }
        if let Some(refresh_token) = &self.refresh_token {
            body["refresh_token"] = json!(refresh_token);
        }
        body
    }
}

/// OIDC Core §3.1.3.6: base64url of the left half of SHA-256 over the access
/// token's ASCII form.
pub fn at_hash(access_token: &str) -> String {
    let digest = crypto::sha256(access_token.as_bytes());
    jose::b64url_encode(&digest[..16])
}

pub struct TokenService {
    config: Arc<Config>,
    keys: Arc<KeyManager>,
    refresh_repo: Arc<dyn RefreshTokenRepo>,
    users: Arc<dyn UserStore>,
}

impl TokenService {
    pub fn new(
        config: Arc<Config>,
        keys: Arc<KeyManager>,
        refresh_repo: Arc<dyn RefreshTokenRepo>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            config,
            keys,
            refresh_repo,
            users,
        }
    }

    fn signing_key(&self) -> ApiResult<Arc<SigningKey>> {
        match self.keys.latest_active(self.config.signing_alg()) {
            Some(key) => Ok(key),
            None => err!("server_error", "No active signing key available"),
        }
    }

    fn audience(&self, client: &Client) -> String {
        self.config.default_audience().map(str::to_string).unwrap_or_else(|| client.uuid.to_string())
    }

    /// Issues the token set for an authenticated end user: access token, ID
    /// token when `openid` was granted, refresh token when `offline_access`
    /// was granted and the client is registered for the grant.
    pub async fn issue(
        &self,
        client: &Client,
        user_sub: &UserId,
        scopes: &[String],
        nonce: Option<&str>,
        auth_time: i64,
    ) -> ApiResult<IssuedTokens> {
        let key = self.signing_key()?;
        let access_token = self.sign_access_token(&key, client, &user_sub.to_string(), scopes, auth_time)?;

        let id_token = if scopes.iter().any(|s| s == "openid") {
            Some(self.sign_id_token(&key, client, user_sub, scopes, nonce, auth_time, &access_token).await?)
        } else {
            None
        };

        let refresh_token = if scopes.iter().any(|s| s == "offline_access")
            && client.allows_grant(GrantType::RefreshToken)
        {
            let (token, record) = RefreshTokenRecord::mint(
                client.uuid.clone(),
                user_sub.clone(),
                scopes.to_vec(),
                auth_time,
                self.config.refresh_token_ttl(),
            );
            self.refresh_repo.insert(&record).await?;
            Some(token)
        } else {
            None
        };

        security_event(
            "token_issued",
            &[("user_id", Some(&user_sub.to_string())), ("client_id", Some(&client.uuid.to_string()))],
        );

        Ok(IssuedTokens {
            access_token,
            id_token,
            refresh_token,
            expires_in: self.config.access_token_ttl(),
            scope: scopes.join(" "),
        })
    }

    /// `client_credentials`: machine token only, `sub` is the client itself.
    pub async fn issue_client_credentials(&self, client: &Client, scopes: &[String]) -> ApiResult<IssuedTokens> {
        let key = self.signing_key()?;
        let now = Utc::now().timestamp();
        let access_token = self.sign_access_token(&key, client, &client.uuid.to_string(), scopes, now)?;

        security_event(
            "token_issued",
            &[("client_id", Some(&client.uuid.to_string())), ("grant_type", Some("client_credentials"))],
        );

        Ok(IssuedTokens {
            access_token,
            id_token: None,
            refresh_token: None,
            expires_in: self.config.access_token_ttl(),
            scope: scopes.join(" "),
        })
    }

    /// Refresh rotation. The presented token is revoked with a compare-and-
    /// set; when the CAS loses (already revoked, or a concurrent rotation got
    /// there first) the whole live chain for the pair is revoked and the
    /// caller gets `invalid_grant`.
    pub async fn rotate_refresh(
        &self,
        client: &Client,
        presented: &str,
        requested_scopes: Option<Vec<String>>,
    ) -> ApiResult<IssuedTokens> {
        let token_hash = crypto::sha256_hex(presented.as_bytes());

        let Some(record) = self.refresh_repo.get(&token_hash).await? else {
            err!("invalid_grant", "Invalid refresh token");
        };
        if record.client_id != client.uuid {
            err!("invalid_grant", "Invalid refresh token");
        }
        if record.is_expired(Utc::now().naive_utc()) {
            err!("invalid_grant", "Refresh token has expired");
        }
        if record.revoked {
            return Err(self.replay_response(&record).await);
        }

        let scopes = match requested_scopes {
            None => record.scopes.clone(),
            Some(requested) => {
                if requested.iter().any(|scope| !record.scopes.contains(scope)) {
                    err!("invalid_scope", "Requested scopes exceed the original grant");
                }
                requested
            }
        };

        // The losing side of a concurrent rotation lands here with applied=false
        if !self.refresh_repo.revoke_if_active(&token_hash).await? {
            return Err(self.replay_response(&record).await);
        }

        self.issue(client, &record.user_sub, &scopes, None, record.auth_time).await
    }

    async fn replay_response(&self, record: &RefreshTokenRecord) -> crate::error::Error {
        match self
            .refresh_repo
            .revoke_issued_since(&record.client_id, &record.user_sub, record.issued_at)
            .await
        {
            Ok(revoked) => {
                security_event(
                    "token_revoked",
                    &[
                        ("user_id", Some(&record.user_sub.to_string())),
                        ("client_id", Some(&record.client_id.to_string())),
                        ("reason", Some("refresh_replay")),
                        ("revoked", Some(&revoked.to_string())),
                    ],
                );
            }
            Err(e) => error!("Failed to revoke refresh chain: {}", e.message()),
        }
        crate::error::Error::new("invalid_grant", "Refresh token reuse detected")
    }

    /// RFC 7009. Always succeeds for valid client auth: unknown tokens and
    /// self-contained access tokens simply have nothing to revoke.
    pub async fn revoke(&self, token: &str, client: &Client) -> ApiResult<()> {
        let token_hash = crypto::sha256_hex(token.as_bytes());
        if let Some(record) = self.refresh_repo.get(&token_hash).await? {
            if record.client_id == client.uuid && self.refresh_repo.revoke_if_active(&token_hash).await? {
                security_event(
                    "token_revoked",
                    &[
                        ("user_id", Some(&record.user_sub.to_string())),
                        ("client_id", Some(&client.uuid.to_string())),
                        ("reason", Some("rfc7009_revocation")),
                    ],
                );
            }
        }
        Ok(())
    }

    /// RFC 7662. Never errors for a well-formed request: any validation
    /// failure is `active: false`.
    pub async fn introspect(&self, token: &str) -> ApiResult<Value> {
        if let Ok(claims) = self.verify_access_token(token) {
            return Ok(json!({
                "active": true,
                "token_type": "Bearer",
                "sub": claims.sub,
                "client_id": claims.client_id,
                "scope": claims.scope,
                "exp": claims.exp,
                "iat": claims.iat,
                "aud": claims.aud,
            }));
        }

        let token_hash = crypto::sha256_hex(token.as_bytes());
        if let Some(record) = self.refresh_repo.get(&token_hash).await? {
            if !record.revoked && !record.is_expired(Utc::now().naive_utc()) {
                return Ok(json!({
                    "active": true,
                    "token_type": "refresh_token",
                    "sub": record.user_sub,
                    "client_id": record.client_id,
                    "scope": record.scopes.join(" "),
                    "exp": record.expires_at.and_utc().timestamp(),
                    "iat": record.issued_at.and_utc().timestamp(),
                }));
            }
        }

        Ok(json!({ "active": false }))
    }

    /// Verifies a JWT this server signed. Key selection is by `kid`, falling
    /// back to the newest active key of the header's algorithm when the hint
    /// is absent; the key's own algorithm is the expected one.
    pub fn verify_local_jwt(&self, token: &str) -> ApiResult<Jws> {
        let header = jose::decode_header(token)?;

        let key = match header.get("kid").and_then(Value::as_str) {
            Some(kid) => self.keys.verification_key(kid),
            None => {
                let alg = header
                    .get("alg")
                    .and_then(Value::as_str)
                    .and_then(Alg::from_str);
                match alg {
                    Some(alg) => self.keys.latest_active(alg),
                    None => err!("invalid_token", "JWT algorithm mismatch"),
                }
            }
        };
        let Some(key) = key else {
            err!("invalid_token", "Unknown signing key");
        };

        let jws = jose::verify(token, key.material(), key.alg)?;
        if jws.payload.get("iss").and_then(Value::as_str) != Some(self.config.issuer()) {
            err!("invalid_token", "Invalid token issuer");
        }
        Ok(jws)
    }

    pub fn verify_access_token(&self, token: &str) -> ApiResult<AccessTokenClaims> {
        let jws = self.verify_local_jwt(token)?;
        Ok(serde_json::from_value(jws.payload)?)
    }

    fn sign_access_token(
        &self,
        key: &SigningKey,
        client: &Client,
        sub: &str,
        scopes: &[String],
        auth_time: i64,
    ) -> ApiResult<String> {
        let now = Utc::now().timestamp();
        let claims = AccessTokenClaims {
            iss: self.config.issuer().to_string(),
            sub: sub.to_string(),
            aud: self.audience(client),
            scope: scopes.join(" "),
            client_id: client.uuid.to_string(),
            iat: now,
            exp: now + self.config.access_token_ttl(),
            jti: uuid::Uuid::new_v4().to_string(),
            auth_time,
        };

        jose::sign(&serde_json::to_value(&claims)?, key.material(), key.alg, Some(&key.kid))
    }

    #[allow(clippy::too_many_arguments)]
    async fn sign_id_token(
        &self,
        key: &SigningKey,
        client: &Client,
        user_sub: &UserId,
        scopes: &[String],
        nonce: Option<&str>,
        auth_time: i64,
        access_token: &str,
    ) -> ApiResult<String> {
        let mut claims = Map::new();
        claims.insert("iss".into(), json!(self.config.issuer()));
        claims.insert("sub".into(), json!(user_sub));
        claims.insert("aud".into(), json!(client.uuid));
        claims.insert("azp".into(), json!(client.uuid));
        claims.insert("auth_time".into(), json!(auth_time));
        claims.insert("at_hash".into(), json!(at_hash(access_token)));
        if let Some(nonce) = nonce {
            claims.insert("nonce".into(), json!(nonce));
        }

        if let Some(account) = self.users.get_account(user_sub).await? {
            let contact = self.users.email_contact(user_sub).await?;
            claims.extend(profile_claims(&account, contact.as_ref(), scopes));
        }

        let payload = jose::build_payload(claims, self.config.id_token_ttl());
        jose::sign(&payload, key.material(), key.alg, Some(&key.kid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ClientId, ResponseType, TokenEndpointAuthMethod};
    use crate::db::Repositories;
    use crate::users::InMemoryUserStore;

    struct Fixture {
        service: TokenService,
        client: Client,
        sub: UserId,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(Config::for_tests("https://id.example.com"));
        let repos = Repositories::in_memory();
        let users = Arc::new(InMemoryUserStore::new());
        let sub = users.seed_account("alice@example.com", "pw", "Alice Example");
        let keys = Arc::new(KeyManager::load(repos.signing_keys.clone(), config.id_token_ttl()).await.unwrap());

        let client = Client::new(
            "Test RP".to_string(),
            vec!["https://rp.example.com/cb".to_string()],
            vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            vec![ResponseType::Code],
            vec!["openid".to_string(), "profile".to_string(), "email".to_string(), "offline_access".to_string()],
            TokenEndpointAuthMethod::ClientSecretBasic,
            Some("hash".to_string()),
        );

        let service = TokenService::new(config, keys, repos.refresh_tokens.clone(), users);
        Fixture {
            service,
            client,
            sub,
        }
    }

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[rocket::async_test]
    async fn issued_access_token_verifies_locally() {
        let fx = fixture().await;
        let issued = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "email"]), None, 1_700_000_000)
            .await
            .unwrap();

        let claims = fx.service.verify_access_token(&issued.access_token).unwrap();
        assert_eq!(claims.iss, "https://id.example.com");
        assert_eq!(claims.sub, fx.sub.to_string());
        assert_eq!(claims.scope, "openid email");
        assert_eq!(claims.client_id, fx.client.uuid.to_string());
        assert_eq!(claims.auth_time, 1_700_000_000);
        assert_eq!(issued.expires_in, 900);
    }

    #[rocket::async_test]
    async fn id_token_carries_at_hash_nonce_and_profile() {
        let fx = fixture().await;
        let issued = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "profile", "email"]), Some("n-0S6_WzA2Mj"), 123)
            .await
            .unwrap();

        let id_token = issued.id_token.expect("openid scope yields an id_token");
        let jws = fx.service.verify_local_jwt(&id_token).unwrap();

        // at_hash is the left half of SHA-256 over the access token
        let digest = crypto::sha256(issued.access_token.as_bytes());
        assert_eq!(jws.payload["at_hash"], json!(jose::b64url_encode(&digest[..16])));

        assert_eq!(jws.payload["aud"], json!(fx.client.uuid));
        assert_eq!(jws.payload["azp"], json!(fx.client.uuid));
        assert_eq!(jws.payload["nonce"], json!("n-0S6_WzA2Mj"));
        assert_eq!(jws.payload["auth_time"], json!(123));
        assert_eq!(jws.payload["name"], json!("Alice Example"));
        assert_eq!(jws.payload["email"], json!("alice@example.com"));
        assert_eq!(jws.payload["email_verified"], json!(true));
    }

    #[rocket::async_test]
    async fn refresh_token_requires_offline_access_and_grant() {
        let fx = fixture().await;

        let with = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        assert!(with.refresh_token.is_some());

        let without = fx.service.issue(&fx.client, &fx.sub, &scopes(&["openid"]), None, 0).await.unwrap();
        assert!(without.refresh_token.is_none());

        let mut no_grant = fx.client.clone();
        no_grant.grant_types = vec![GrantType::AuthorizationCode];
        let refused = fx
            .service
            .issue(&no_grant, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        assert!(refused.refresh_token.is_none());
    }

    #[rocket::async_test]
    async fn rotation_revokes_presented_token() {
        let fx = fixture().await;
        let first = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        let rt1 = first.refresh_token.unwrap();

        let second = fx.service.rotate_refresh(&fx.client, &rt1, None).await.unwrap();
        let rt2 = second.refresh_token.expect("rotation yields a new refresh token");
        assert_ne!(rt1, rt2);

        // rt1 is now dead
        let err = fx.service.rotate_refresh(&fx.client, &rt1, None).await.unwrap_err();
        assert_eq!(err.error(), "invalid_grant");

        // the replay killed the whole chain, rt2 included
        let err = fx.service.rotate_refresh(&fx.client, &rt2, None).await.unwrap_err();
        assert_eq!(err.error(), "invalid_grant");
    }

    #[rocket::async_test]
    async fn rotation_rejects_scope_escalation() {
        let fx = fixture().await;
        let issued = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        let rt = issued.refresh_token.unwrap();

        let err = fx
            .service
            .rotate_refresh(&fx.client, &rt, Some(scopes(&["openid", "offline_access", "email"])))
            .await
            .unwrap_err();
        assert_eq!(err.error(), "invalid_scope");
    }

    #[rocket::async_test]
    async fn rotation_rejects_other_clients_tokens() {
        let fx = fixture().await;
        let issued = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        let rt = issued.refresh_token.unwrap();

        let mut other = fx.client.clone();
        other.uuid = ClientId::random();
        let err = fx.service.rotate_refresh(&other, &rt, None).await.unwrap_err();
        assert_eq!(err.error(), "invalid_grant");
    }

    #[rocket::async_test]
    async fn revoke_and_introspect() {
        let fx = fixture().await;
        let issued = fx
            .service
            .issue(&fx.client, &fx.sub, &scopes(&["openid", "offline_access"]), None, 0)
            .await
            .unwrap();
        let rt = issued.refresh_token.unwrap();

        let active = fx.service.introspect(&rt).await.unwrap();
        assert_eq!(active["active"], json!(true));
        assert_eq!(active["sub"], json!(fx.sub));

        fx.service.revoke(&rt, &fx.client).await.unwrap();
        // idempotent
        fx.service.revoke(&rt, &fx.client).await.unwrap();

        let inactive = fx.service.introspect(&rt).await.unwrap();
        assert_eq!(inactive, json!({ "active": false }));

        // access tokens introspect from local keys, no storage involved
        let access = fx.service.introspect(&issued.access_token).await.unwrap();
        assert_eq!(access["active"], json!(true));
        assert_eq!(access["client_id"], json!(fx.client.uuid));

        assert_eq!(fx.service.introspect("garbage").await.unwrap(), json!({ "active": false }));
    }

    #[rocket::async_test]
    async fn client_credentials_tokens_have_client_sub() {
        let fx = fixture().await;
        let issued = fx.service.issue_client_credentials(&fx.client, &scopes(&["openid"])).await.unwrap();

        assert!(issued.id_token.is_none());
        assert!(issued.refresh_token.is_none());
        let claims = fx.service.verify_access_token(&issued.access_token).unwrap();
        assert_eq!(claims.sub, fx.client.uuid.to_string());
    }
}
