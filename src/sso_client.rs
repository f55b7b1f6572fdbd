//
// Outbound HTTP for federated providers
//
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use data_encoding::BASE64URL_NOPAD;
use moka::future::Cache;
use openssl::{
    bn::BigNum,
    ec::{EcGroup, EcKey},
    pkey::PKey,
    rsa::Rsa,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    api::ApiResult,
    error::Error,
    jose::{Alg, KeyMaterial},
    sso::ProviderConfig,
};

// Every provider call is bounded; a hung upstream must not pin request handlers.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_JWKS_MAX_AGE: u64 = 600;

#[derive(Debug, Deserialize)]
pub struct ProviderTokenResponse {
    pub access_token: String,
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub struct JwkEntry {
    pub alg: Option<Alg>,
    pub material: KeyMaterial,
}

/// One provider's parsed JWKS document plus its freshness window.
pub struct ProviderJwks {
    keys: HashMap<String, JwkEntry>,
    fetched_at: i64,
    max_age: u64,
}

impl ProviderJwks {
    pub fn key(&self, kid: &str) -> Option<&JwkEntry> {
        self.keys.get(kid)
    }

    fn is_fresh(&self) -> bool {
        Utc::now().timestamp() < self.fetched_at + self.max_age as i64
    }

    /// Parses an RFC 7517 `{"keys": [...]}` document. Unusable entries are
    /// skipped rather than failing the whole set; providers routinely list
    /// key types this server does not consume.
    pub fn from_document(document: &Value, max_age: u64) -> Self {
        let mut keys = HashMap::new();
        let empty = vec![];

        for jwk in document.get("keys").and_then(Value::as_array).unwrap_or(&empty) {
            let Some(kid) = jwk.get("kid").and_then(Value::as_str) else {
                continue;
            };
            let material = match jwk.get("kty").and_then(Value::as_str) {
                Some("RSA") => rsa_from_jwk(jwk),
                Some("EC") => ec_from_jwk(jwk),
                _ => None,
            };
            let Some(material) = material else {
                debug!("Skipping unusable JWK {kid}");
                continue;
            };

            keys.insert(
                kid.to_string(),
                JwkEntry {
                    alg: jwk.get("alg").and_then(Value::as_str).and_then(Alg::from_str),
                    material,
                },
            );
        }

        ProviderJwks {
            keys,
            fetched_at: Utc::now().timestamp(),
            max_age,
        }
    }
}

fn b64_bignum(jwk: &Value, field: &str) -> Option<BigNum> {
    let raw = jwk.get(field)?.as_str()?;
    let bytes = BASE64URL_NOPAD.decode(raw.as_bytes()).ok()?;
    BigNum::from_slice(&bytes).ok()
}

fn rsa_from_jwk(jwk: &Value) -> Option<KeyMaterial> {
    let n = b64_bignum(jwk, "n")?;
    let e = b64_bignum(jwk, "e")?;
    let rsa = Rsa::from_public_components(n, e).ok()?;
    PKey::from_rsa(rsa).ok().map(KeyMaterial::Public)
}

fn ec_from_jwk(jwk: &Value) -> Option<KeyMaterial> {
    let alg = match jwk.get("crv").and_then(Value::as_str) {
        Some("P-256") => Alg::ES256,
        Some("P-384") => Alg::ES384,
        Some("P-521") => Alg::ES512,
        _ => return None,
    };
    let group = EcGroup::from_curve_name(alg.curve_nid()?).ok()?;
    let x = b64_bignum(jwk, "x")?;
    let y = b64_bignum(jwk, "y")?;
    let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y).ok()?;
    PKey::from_ec_key(ec).ok().map(KeyMaterial::Public)
}

/// Shared reqwest client plus the per-provider JWKS cache. Cache population
/// is single-flight: concurrent misses for the same URL coalesce into one
/// fetch and everybody awaits its result.
pub struct SsoClient {
    http: reqwest::Client,
    jwks_cache: Cache<String, Arc<ProviderJwks>>,
}

impl SsoClient {
    pub fn new() -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(SsoClient {
            http,
            jwks_cache: Cache::builder().max_capacity(16).build(),
        })
    }

    pub async fn jwks(&self, url: &str) -> ApiResult<Arc<ProviderJwks>> {
        if let Some(cached) = self.jwks_cache.get(url).await {
            if cached.is_fresh() {
                return Ok(cached);
            }
            self.jwks_cache.invalidate(url).await;
        }

        let http = self.http.clone();
        let fetch_url = url.to_string();
        self.jwks_cache
            .try_get_with(url.to_string(), async move {
                // One retry: the fetch is an idempotent read
                let document = match fetch_jwks(&http, &fetch_url).await {
                    Ok(document) => document,
                    Err(e) => {
                        warn!("JWKS fetch from {fetch_url} failed, retrying once: {}", e.message());
                        fetch_jwks(&http, &fetch_url).await?
                    }
                };
                Ok(Arc::new(document))
            })
            .await
            .map_err(|e: Arc<Error>| Error::new(e.error(), e.message().to_string()))
    }

    /// Redeems an authorization code at the provider's token endpoint.
    pub async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        redirect_uri: &str,
        code: &str,
        code_verifier: Option<&str>,
    ) -> ApiResult<ProviderTokenResponse> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", provider.client_id.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }
        if !provider.token_auth_basic {
            params.push(("client_secret", provider.client_secret.as_str()));
        }

        let mut request = self.http.post(&provider.token_url).form(&params);
        if provider.token_auth_basic {
            request = request.basic_auth(&provider.client_id, Some(&provider.client_secret));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            err!("server_error", format!("{} token endpoint returned {status}: {body}", provider.kind));
        }

        Ok(response.json::<ProviderTokenResponse>().await?)
    }

    /// Bearer GET against a provider profile endpoint (Facebook Graph `/me`,
    /// X `/2/users/me`).
    pub async fn fetch_profile(&self, url: &str, access_token: &str) -> ApiResult<Value> {
        let response = self.http.get(url).bearer_auth(access_token).send().await?;
        if !response.status().is_success() {
            err!("server_error", format!("Profile endpoint returned {}", response.status()));
        }
        Ok(response.json::<Value>().await?)
    }
}

fn cache_max_age(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value.split(',').find_map(|directive| directive.trim().strip_prefix("max-age="))
        })
        .and_then(|age| age.parse().ok())
        .unwrap_or(DEFAULT_JWKS_MAX_AGE)
}

async fn fetch_jwks(http: &reqwest::Client, url: &str) -> ApiResult<ProviderJwks> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        err!("server_error", format!("JWKS endpoint {url} returned {}", response.status()));
    }

    let max_age = cache_max_age(&response);
    let document = response.json::<Value>().await?;
    Ok(ProviderJwks::from_document(&document, max_age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;

    #[test]
    fn jwks_document_parsing_keeps_usable_keys() {
        let rsa = SigningKey::generate(Alg::RS256).unwrap();
        let ec = SigningKey::generate(Alg::ES256).unwrap();
        let document = serde_json::json!({
            "keys": [
                rsa.public_jwk().unwrap().unwrap(),
                ec.public_jwk().unwrap().unwrap(),
                { "kty": "OKP", "kid": "ignored", "crv": "Ed25519", "x": "AA" },
                { "kty": "RSA" }, // no kid
            ]
        });

        let jwks = ProviderJwks::from_document(&document, 600);
        assert!(jwks.key(&rsa.kid).is_some());
        assert!(jwks.key(&ec.kid).is_some());
        assert!(jwks.key("ignored").is_none());
        assert_eq!(jwks.key(&rsa.kid).unwrap().alg, Some(Alg::RS256));
        assert!(jwks.is_fresh());
    }

    #[test]
    fn stale_jwks_reports_unfresh() {
        let document = serde_json::json!({ "keys": [] });
        let mut jwks = ProviderJwks::from_document(&document, 600);
        jwks.fetched_at -= 601;
        assert!(!jwks.is_fresh());
    }
}
