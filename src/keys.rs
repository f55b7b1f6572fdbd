//
// Signing key registry
//
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{NaiveDateTime, TimeDelta, Utc};
use data_encoding::BASE64URL_NOPAD;
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    pkey::PKey,
    rsa::Rsa,
};
use serde_json::{json, Value};

use crate::{
    api::ApiResult,
    crypto,
    db::{models::SigningKeyRecord, SigningKeyRepo},
    jose::{b64url_encode, Alg, KeyMaterial},
};

pub struct SigningKey {
    pub kid: String,
    pub alg: Alg,
    pub created_at: NaiveDateTime,
    pub retired_at: Option<NaiveDateTime>,
    material: KeyMaterial,
}

impl SigningKey {
    pub fn generate(alg: Alg) -> ApiResult<Self> {
        let material = match alg.kty() {
            "RSA" => KeyMaterial::Private(PKey::from_rsa(Rsa::generate(2048)?)?),
            "EC" => {
                let group = EcGroup::from_curve_name(alg.curve_nid().expect("EC alg has a curve"))?;
                KeyMaterial::Private(PKey::from_ec_key(EcKey::generate(&group)?)?)
            }
            _ => KeyMaterial::Secret(crypto::get_random_bytes::<64>().to_vec()),
        };

        Ok(SigningKey {
            kid: uuid::Uuid::new_v4().to_string(),
            alg,
            created_at: Utc::now().naive_utc(),
            retired_at: None,
            material,
        })
    }

    fn from_record(record: &SigningKeyRecord) -> ApiResult<Self> {
        let material = match (&record.private_pem, &record.secret_b64) {
            (Some(pem), _) => KeyMaterial::Private(PKey::private_key_from_pem(pem.as_bytes())?),
            (None, Some(secret)) => match BASE64URL_NOPAD.decode(secret.as_bytes()) {
                Ok(bytes) => KeyMaterial::Secret(bytes),
                Err(_) => err!("server_error", format!("Corrupt secret material for key {}", record.kid)),
            },
            (None, None) => err!("server_error", format!("Signing key {} has no material", record.kid)),
        };

        Ok(SigningKey {
            kid: record.kid.clone(),
            alg: record.alg,
            created_at: record.created_at,
            retired_at: record.retired_at,
            material,
        })
    }

    fn to_record(&self) -> ApiResult<SigningKeyRecord> {
        let (private_pem, secret_b64) = match &self.material {
            KeyMaterial::Private(pkey) => {
                (Some(String::from_utf8_lossy(&pkey.private_key_to_pem_pkcs8()?).to_string()), None)
            }
            KeyMaterial::Secret(secret) => (None, Some(BASE64URL_NOPAD.encode(secret))),
            KeyMaterial::Public(_) => err!("server_error", "Refusing to persist a public-only key"),
        };

        Ok(SigningKeyRecord {
            kid: self.kid.clone(),
            alg: self.alg,
            private_pem,
            secret_b64,
            created_at: self.created_at,
            retired_at: self.retired_at,
        })
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    /// RFC 7517 JWK with public parameters only. `None` for HMAC keys, which
    /// are never published. Integers are unpadded big-endian, so no leading
    /// zero byte appears in `n`, `e`, `x` or `y`.
    pub fn public_jwk(&self) -> ApiResult<Option<Value>> {
        let KeyMaterial::Private(pkey) = &self.material else {
            return Ok(None);
        };

        let jwk = match self.alg.kty() {
            "RSA" => {
                let rsa = pkey.rsa()?;
                json!({
                    "kty": "RSA",
                    "kid": self.kid,
                    "use": "sig",
                    "alg": self.alg.as_str(),
                    "n": b64url_encode(&rsa.n().to_vec()),
                    "e": b64url_encode(&rsa.e().to_vec()),
                })
            }
            "EC" => {
                let ec = pkey.ec_key()?;
                let group = EcGroup::from_curve_name(self.alg.curve_nid().expect("EC alg has a curve"))?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key().affine_coordinates(&group, &mut x, &mut y, &mut ctx)?;
                json!({
                    "kty": "EC",
                    "kid": self.kid,
                    "use": "sig",
                    "alg": self.alg.as_str(),
                    "crv": self.alg.crv().expect("EC alg has a curve name"),
                    "x": b64url_encode(&x.to_vec()),
                    "y": b64url_encode(&y.to_vec()),
                })
            }
            _ => return Ok(None),
        };

        Ok(Some(jwk))
    }
}

/// Process-wide key registry. Reads (every token operation) take the shared
/// lock; generation and retirement are rare and swap state under the writer
/// lock, so rotation is observable but never blocks verification for long.
pub struct KeyManager {
    keys: RwLock<HashMap<String, Arc<SigningKey>>>,
    repo: Arc<dyn SigningKeyRepo>,
    id_token_ttl: i64,
}

impl KeyManager {
    /// Loads persisted keys and generates the bootstrap pair (RS256 + ES256)
    /// missing on first start, so the discovery document is truthful.
    pub async fn load(repo: Arc<dyn SigningKeyRepo>, id_token_ttl: i64) -> ApiResult<Self> {
        let mut keys = HashMap::new();
        for record in repo.list().await? {
            match SigningKey::from_record(&record) {
                Ok(key) => {
                    keys.insert(key.kid.clone(), Arc::new(key));
                }
                Err(e) => error!("Skipping unusable signing key {}: {}", record.kid, e.message()),
            }
        }

        let manager = KeyManager {
            keys: RwLock::new(keys),
            repo,
            id_token_ttl,
        };

        for alg in [Alg::RS256, Alg::ES256] {
            if manager.latest_active(alg).is_none() {
                info!("Generating bootstrap {alg} signing key");
                manager.generate(alg).await?;
            }
        }

        Ok(manager)
    }

    pub async fn generate(&self, alg: Alg) -> ApiResult<Arc<SigningKey>> {
        let key = Arc::new(SigningKey::generate(alg)?);
        self.repo.insert(&key.to_record()?).await?;
        self.keys.write().unwrap().insert(key.kid.clone(), key.clone());
        Ok(key)
    }

    /// Retired keys keep verifying and stay in the JWKS for the grace period,
    /// but are never selected for signing again.
    pub async fn retire(&self, kid: &str) -> ApiResult<bool> {
        let retired_at = Utc::now().naive_utc();
        if !self.repo.mark_retired(kid, retired_at).await? {
            return Ok(false);
        }

        let mut keys = self.keys.write().unwrap();
        if let Some(existing) = keys.get(kid) {
            let retired = SigningKey {
                kid: existing.kid.clone(),
                alg: existing.alg,
                created_at: existing.created_at,
                retired_at: Some(retired_at),
                material: existing.material().clone(),
            };
            keys.insert(kid.to_string(), Arc::new(retired));
        }
        Ok(true)
    }

    /// Lookup for signing-side callers: only non-retired keys.
    pub fn active_keypair(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.read().unwrap().get(kid).filter(|key| !key.is_retired()).cloned()
    }

    /// Lookup for verification: any known key, retired or not, so tokens
    /// signed before a rotation keep verifying until they expire.
    pub fn verification_key(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.read().unwrap().get(kid).cloned()
    }

    /// The newest non-retired key for the algorithm.
    pub fn latest_active(&self, alg: Alg) -> Option<Arc<SigningKey>> {
        self.keys
            .read()
            .unwrap()
            .values()
            .filter(|key| key.alg == alg && !key.is_retired())
            .max_by_key(|key| key.created_at)
            .cloned()
    }

    /// The published key set. A retired key stays listed until every ID token
    /// it may have signed has expired; HMAC keys never appear.
    pub fn jwks(&self) -> Value {
        let grace_cutoff = Utc::now().naive_utc() - TimeDelta::try_seconds(self.id_token_ttl).unwrap_or_default();

        let mut entries: Vec<(NaiveDateTime, Value)> = self
            .keys
            .read()
            .unwrap()
            .values()
            .filter(|key| match key.retired_at {
                None => true,
                Some(retired_at) => retired_at > grace_cutoff,
            })
            .filter_map(|key| match key.public_jwk() {
                Ok(Some(jwk)) => Some((key.created_at, jwk)),
                Ok(None) => None,
                Err(e) => {
                    error!("Failed to export JWK for {}: {}", key.kid, e.message());
                    None
                }
            })
            .collect();

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        json!({ "keys": entries.into_iter().map(|(_, jwk)| jwk).collect::<Vec<_>>() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repositories;

    async fn manager() -> KeyManager {
        let repos = Repositories::in_memory();
        KeyManager::load(repos.signing_keys, 900).await.unwrap()
    }

    #[rocket::async_test]
    async fn bootstrap_generates_rs256_and_es256() {
        let manager = manager().await;
        assert!(manager.latest_active(Alg::RS256).is_some());
        assert!(manager.latest_active(Alg::ES256).is_some());

        let jwks = manager.jwks();
        let kids: Vec<&str> =
            jwks["keys"].as_array().unwrap().iter().map(|k| k["kid"].as_str().unwrap()).collect();
        assert_eq!(kids.len(), 2);
    }

    #[rocket::async_test]
    async fn jwks_never_contains_private_material_or_hmac_keys() {
        let manager = manager().await;
        manager.generate(Alg::HS256).await.unwrap();
        manager.generate(Alg::ES512).await.unwrap();

        let jwks = manager.jwks();
        let keys = jwks["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 3); // RS256 + ES256 + ES512, no oct
        for key in keys {
            for private_field in ["d", "p", "q", "dp", "dq", "qi", "k"] {
                assert!(key.get(private_field).is_none(), "JWK leaks {private_field}");
            }
            // minimal-length encoding: no leading zero byte
            for coord in ["n", "x", "y"] {
                if let Some(value) = key.get(coord).and_then(Value::as_str) {
                    let bytes = BASE64URL_NOPAD.decode(value.as_bytes()).unwrap();
                    assert_ne!(bytes.first(), Some(&0u8), "{coord} has a leading zero byte");
                }
            }
        }
    }

    #[rocket::async_test]
    async fn retired_keys_never_sign_but_verify_within_grace() {
        let manager = manager().await;
        let key = manager.latest_active(Alg::RS256).unwrap();
        let kid = key.kid.clone();

        assert!(manager.retire(&kid).await.unwrap());
        // CAS: a second retire does not apply
        assert!(!manager.retire(&kid).await.unwrap());

        assert!(manager.active_keypair(&kid).is_none());
        assert!(manager.verification_key(&kid).is_some());
        assert!(manager.latest_active(Alg::RS256).map(|k| k.kid != kid).unwrap_or(true));

        // freshly retired: still published for the grace period
        let jwks = manager.jwks();
        assert!(jwks["keys"].as_array().unwrap().iter().any(|k| k["kid"] == json!(kid)));
    }

    #[rocket::async_test]
    async fn latest_active_prefers_newest_key() {
        let manager = manager().await;
        let first = manager.latest_active(Alg::RS256).unwrap();
        // Force a distinct creation instant
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager.generate(Alg::RS256).await.unwrap();

        assert_ne!(first.kid, second.kid);
        assert_eq!(manager.latest_active(Alg::RS256).unwrap().kid, second.kid);
    }

    #[rocket::async_test]
    async fn ec_jwk_carries_curve_and_coordinates() {
        let manager = manager().await;
        let jwks = manager.jwks();
        let ec = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .find(|k| k["kty"] == json!("EC"))
            .expect("ES256 bootstrap key present");
        assert_eq!(ec["crv"], json!("P-256"));
        assert!(ec.get("x").is_some() && ec.get("y").is_some());
        assert_eq!(ec["use"], json!("sig"));
    }
}
