//
// Federated login (Google / Microsoft / Facebook / X)
//
// The server acts as an OIDC relying party against the configured providers.
// Google and Microsoft return ID tokens validated against their JWKS; the
// Facebook and X flows have no standard ID token and normalize a profile
// endpoint response instead. Either way the result is a `ProviderUserInfo`
// linked to a local account.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rocket::request::FromParam;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{
    api::ApiResult,
    config::Config,
    crypto,
    db::{
        models::{OAuthState, ProviderAccount, UserId},
        Repositories,
    },
    jose::{self, Alg},
    session::sanitize_return_to,
    sso_client::{ProviderJwks, SsoClient},
    users::{Profile, UserStore},
    util::security_event,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Microsoft,
    Facebook,
    X,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] =
        [ProviderKind::Google, ProviderKind::Microsoft, ProviderKind::Facebook, ProviderKind::X];

    /// Stable lowercase identifier, used in paths and storage.
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Facebook => "facebook",
            ProviderKind::X => "x",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Google => "Google",
            ProviderKind::Microsoft => "Microsoft",
            ProviderKind::Facebook => "Facebook",
            ProviderKind::X => "X",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl<'r> FromParam<'r> for ProviderKind {
    type Error = ();

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        ProviderKind::ALL.into_iter().find(|kind| kind.id() == param).ok_or(())
    }
}

enum IssuerCheck {
    AnyOf(Vec<String>),
    /// `MICROSOFT_TENANT=common`: any `https://login.microsoftonline.com/{tid}/v2.0`
    MicrosoftAnyTenant,
}

pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    pub jwks_url: Option<String>,
    pub profile_url: Option<String>,
    pub scopes: &'static str,
    pub algs: Vec<Alg>,
    pub uses_pkce: bool,
    pub token_auth_basic: bool,
    /// Google and Microsoft attest `email_verified`; linking trusts only
    /// verified addresses from them.
    pub require_verified_email: bool,
    issuer_check: IssuerCheck,
}

impl ProviderConfig {
    fn issuer_allowed(&self, iss: &str) -> bool {
        match &self.issuer_check {
            IssuerCheck::AnyOf(issuers) => issuers.iter().any(|allowed| allowed == iss),
            IssuerCheck::MicrosoftAnyTenant => {
                iss.strip_prefix("https://login.microsoftonline.com/")
                    .and_then(|rest| rest.strip_suffix("/v2.0"))
                    .map(|tenant| !tenant.is_empty() && !tenant.contains('/'))
                    .unwrap_or(false)
            }
        }
    }
}

/// Normalized identity from any provider.
#[derive(Clone, Debug)]
pub struct ProviderUserInfo {
    pub sub: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

pub struct SsoProviders {
    providers: HashMap<ProviderKind, ProviderConfig>,
}

impl SsoProviders {
    pub fn from_config(config: &Config) -> Self {
        let mut providers = HashMap::new();

        if let Some(creds) = config.google() {
            providers.insert(
                ProviderKind::Google,
                ProviderConfig {
                    kind: ProviderKind::Google,
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    authorization_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                    token_url: "https://oauth2.googleapis.com/token".to_string(),
                    jwks_url: Some("https://www.googleapis.com/oauth2/v3/certs".to_string()),
                    profile_url: None,
                    scopes: "openid profile email",
                    algs: vec![Alg::RS256],
                    uses_pkce: false,
                    token_auth_basic: false,
                    require_verified_email: true,
                    // Google issues both forms depending on token age
                    issuer_check: IssuerCheck::AnyOf(vec![
                        "https://accounts.google.com".to_string(),
                        "accounts.google.com".to_string(),
                    ]),
                },
            );
        }

        if let Some(creds) = config.microsoft() {
            let tenant = config.microsoft_tenant();
            providers.insert(
                ProviderKind::Microsoft,
                ProviderConfig {
                    kind: ProviderKind::Microsoft,
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    authorization_url: format!(
                        "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"
                    ),
                    token_url: format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
                    jwks_url: Some(format!("https://login.microsoftonline.com/{tenant}/discovery/v2.0/keys")),
                    profile_url: None,
                    scopes: "openid profile email",
                    algs: vec![Alg::RS256],
                    uses_pkce: false,
                    token_auth_basic: false,
                    require_verified_email: true,
                    issuer_check: if tenant == "common" {
                        IssuerCheck::MicrosoftAnyTenant
                    } else {
                        IssuerCheck::AnyOf(vec![format!("https://login.microsoftonline.com/{tenant}/v2.0")])
                    },
                },
            );
        }

        if let Some(creds) = config.facebook() {
            providers.insert(
                ProviderKind::Facebook,
                ProviderConfig {
                    kind: ProviderKind::Facebook,
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    authorization_url: "https://www.facebook.com/v19.0/dialog/oauth".to_string(),
                    token_url: "https://graph.facebook.com/v19.0/oauth/access_token".to_string(),
                    jwks_url: None,
                    profile_url: Some(
                        "https://graph.facebook.com/v19.0/me?fields=id,name,email,first_name,last_name,picture"
                            .to_string(),
                    ),
                    scopes: "email public_profile",
                    algs: vec![],
                    uses_pkce: false,
                    token_auth_basic: false,
                    require_verified_email: false,
                    issuer_check: IssuerCheck::AnyOf(vec![]),
                },
            );
        }

        if let Some(creds) = config.x() {
            providers.insert(
                ProviderKind::X,
                ProviderConfig {
                    kind: ProviderKind::X,
                    client_id: creds.client_id.clone(),
                    client_secret: creds.client_secret.clone(),
                    authorization_url: "https://x.com/i/oauth2/authorize".to_string(),
                    token_url: "https://api.x.com/2/oauth2/token".to_string(),
                    jwks_url: None,
                    profile_url: Some("https://api.x.com/2/users/me?user.fields=name,profile_image_url".to_string()),
                    scopes: "users.read tweet.read",
                    algs: vec![],
                    uses_pkce: true,
                    token_auth_basic: true,
                    require_verified_email: false,
                    issuer_check: IssuerCheck::AnyOf(vec![]),
                },
            );
        }

        SsoProviders {
            providers,
        }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(&kind)
    }
}

/// Validates a provider ID token against that provider's JWKS and contract:
/// required `kid`, algorithm restricted to the provider's advertised set,
/// issuer and audience pinning, and the standard time checks via `jose`.
pub fn validate_id_token(
    provider: &ProviderConfig,
    id_token: &str,
    jwks: &ProviderJwks,
) -> ApiResult<ProviderUserInfo> {
    let header = jose::decode_header(id_token)?;

    let alg = header.get("alg").and_then(Value::as_str).and_then(Alg::from_str);
    let Some(alg) = alg.filter(|alg| provider.algs.contains(alg)) else {
        err!("invalid_token", "JWT algorithm mismatch");
    };

    let Some(kid) = header.get("kid").and_then(Value::as_str) else {
        err!("invalid_token", format!("{provider_name} ID token missing kid in header", provider_name = provider.kind));
    };
    let Some(entry) = jwks.key(kid) else {
        err!("invalid_token", format!("No key {kid} in {} JWKS", provider.kind));
    };
    if let Some(key_alg) = entry.alg {
        if key_alg != alg {
            err!("invalid_token", "JWT algorithm mismatch");
        }
    }

    let jws = jose::verify(id_token, &entry.material, alg)?;
    let payload = jws.payload;

    match payload.get("iss").and_then(Value::as_str) {
        Some(iss) if provider.issuer_allowed(iss) => {}
        _ => err!("invalid_token", "Invalid token issuer"),
    }

    let aud_ok = match payload.get("aud") {
        Some(Value::String(aud)) => *aud == provider.client_id,
        Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(&provider.client_id)),
        _ => false,
    };
    if !aud_ok {
        err!("invalid_token", "Invalid token audience");
    }

    let email = payload.get("email").and_then(Value::as_str).map(|e| e.to_lowercase());
    let email_verified = payload.get("email_verified").and_then(Value::as_bool);
    if provider.require_verified_email && email.is_some() && email_verified == Some(false) {
        err!("invalid_request", format!("{} account email is not verified", provider.kind));
    }

    let Some(sub) = payload.get("sub").and_then(Value::as_str) else {
        err!("invalid_token", "ID token is missing the sub claim");
    };

    Ok(ProviderUserInfo {
        sub: sub.to_string(),
        email,
        email_verified,
        name: payload.get("name").and_then(Value::as_str).map(str::to_string),
        given_name: payload.get("given_name").and_then(Value::as_str).map(str::to_string),
        family_name: payload.get("family_name").and_then(Value::as_str).map(str::to_string),
        picture: payload.get("picture").and_then(Value::as_str).map(str::to_string),
    })
}

/// Facebook Graph `/me` with the fields this server requests.
fn normalize_facebook(profile: &Value) -> ApiResult<ProviderUserInfo> {
    let Some(sub) = profile.get("id").and_then(Value::as_str) else {
        err!("server_error", "Facebook profile response is missing id");
    };

    Ok(ProviderUserInfo {
        sub: sub.to_string(),
        email: profile.get("email").and_then(Value::as_str).map(|e| e.to_lowercase()),
        // Graph only returns addresses Facebook has verified
        email_verified: profile.get("email").map(|_| true),
        name: profile.get("name").and_then(Value::as_str).map(str::to_string),
        given_name: profile.get("first_name").and_then(Value::as_str).map(str::to_string),
        family_name: profile.get("last_name").and_then(Value::as_str).map(str::to_string),
        picture: profile
            .pointer("/picture/data/url")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// X `/2/users/me`; the interesting part is wrapped in `data`, and no email
/// is available on this endpoint.
fn normalize_x(profile: &Value) -> ApiResult<ProviderUserInfo> {
    let Some(sub) = profile.pointer("/data/id").and_then(Value::as_str) else {
        err!("server_error", "X profile response is missing data.id");
    };

    Ok(ProviderUserInfo {
        sub: sub.to_string(),
        email: None,
        email_verified: None,
        name: profile.pointer("/data/name").and_then(Value::as_str).map(str::to_string),
        given_name: None,
        family_name: None,
        picture: profile.pointer("/data/profile_image_url").and_then(Value::as_str).map(str::to_string),
    })
}

pub struct Sso {
    providers: SsoProviders,
    client: SsoClient,
    config: Arc<Config>,
    repos: Repositories,
    users: Arc<dyn UserStore>,
}

impl Sso {
    pub fn new(config: Arc<Config>, repos: Repositories, users: Arc<dyn UserStore>) -> ApiResult<Self> {
        Ok(Sso {
            providers: SsoProviders::from_config(&config),
            client: SsoClient::new()?,
            config,
            repos,
            users,
        })
    }

    fn provider(&self, kind: ProviderKind) -> ApiResult<&ProviderConfig> {
        match self.providers.get(kind) {
            Some(provider) => Ok(provider),
            None => err_code!("temporarily_unavailable", format!("{kind} login is not configured"), 503),
        }
    }

    /// Mints the state row and builds the provider authorization URL.
    pub async fn authorize_url(&self, kind: ProviderKind, return_to: Option<&str>) -> ApiResult<Url> {
        let provider = self.provider(kind)?;

        let code_verifier = provider.uses_pkce.then(crypto::generate_token);
        let state = OAuthState::new(
            kind,
            sanitize_return_to(return_to),
            code_verifier.clone(),
            self.config.oauth_state_ttl(),
        );
        self.repos.oauth_state.insert(&state).await?;

        let mut url = Url::parse(&provider.authorization_url)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &self.config.provider_redirect_uri(kind.id()))
            .append_pair("scope", provider.scopes)
            .append_pair("state", &state.state);
        if let Some(verifier) = &code_verifier {
            let challenge = jose::b64url_encode(&crypto::sha256(verifier.as_bytes()));
            url.query_pairs_mut()
                .append_pair("code_challenge", &challenge)
                .append_pair("code_challenge_method", "S256");
        }

        Ok(url)
    }

    /// Handles the provider redirect: consumes the state row (single use),
    /// exchanges the code, validates the identity and resolves the local
    /// account. Returns the local `sub` and the sanitized `return_to`.
    pub async fn handle_callback(&self, kind: ProviderKind, state: &str, code: &str) -> ApiResult<(UserId, String)> {
        let provider = self.provider(kind)?;

        let Some(state_row) = self.repos.oauth_state.consume(state).await? else {
            security_event("auth_failure", &[("provider", Some(kind.id())), ("reason", Some("state_replay"))]);
            err!("Invalid, expired or replayed state");
        };
        if state_row.provider != kind {
            err!("State does not belong to this provider");
        }

        let redirect_uri = self.config.provider_redirect_uri(kind.id());
        let tokens =
            self.client.exchange_code(provider, &redirect_uri, code, state_row.code_verifier.as_deref()).await?;

        let info = match (&provider.jwks_url, &provider.profile_url) {
            (Some(jwks_url), _) => {
                let Some(id_token) = &tokens.id_token else {
                    err!("server_error", format!("{kind} token response did not contain an id_token"));
                };
                let jwks = self.client.jwks(jwks_url).await?;
                match validate_id_token(provider, id_token, &jwks) {
                    Ok(info) => info,
                    Err(e) => {
                        security_event(
                            "auth_failure",
                            &[("provider", Some(kind.id())), ("reason", Some(e.message()))],
                        );
                        return Err(e);
                    }
                }
            }
            (None, Some(profile_url)) => {
                let profile = self.client.fetch_profile(profile_url, &tokens.access_token).await?;
                match kind {
                    ProviderKind::X => normalize_x(&profile)?,
                    _ => normalize_facebook(&profile)?,
                }
            }
            (None, None) => err!("server_error", format!("{kind} has neither a JWKS nor a profile endpoint")),
        };

        let sub = self.resolve_user(kind, &info).await?;
        security_event(
            "auth_success",
            &[("provider", Some(kind.id())), ("user_id", Some(&sub.to_string()))],
        );

        Ok((sub, state_row.return_to))
    }

    /// `(provider, provider_sub)` wins; otherwise find-or-create by verified
    /// email and record the link for next time.
    async fn resolve_user(&self, kind: ProviderKind, info: &ProviderUserInfo) -> ApiResult<UserId> {
        if let Some(link) = self.repos.provider_accounts.get(kind, &info.sub).await? {
            return Ok(link.account_id);
        }

        let Some(email) = &info.email else {
            err!("invalid_request", format!("{kind} did not supply an email address to link an account with"));
        };

        let (account, contact) = match self.users.find_account_by_email(email).await? {
            Some(pair) => pair,
            None => {
                self.users
                    .create_account_with_email(
                        email,
                        info.email_verified.unwrap_or(false),
                        Profile {
                            name: info.name.clone(),
                            given_name: info.given_name.clone(),
                            family_name: info.family_name.clone(),
                            picture: info.picture.clone(),
                        },
                    )
                    .await?
            }
        };

        let link = ProviderAccount::new(kind, info.sub.clone(), account.uuid.clone(), contact.contact_id.clone());
        if !self.repos.provider_accounts.insert_if_absent(&link).await? {
            // Lost a first-login race; the stored link is authoritative
            if let Some(existing) = self.repos.provider_accounts.get(kind, &info.sub).await? {
                return Ok(existing.account_id);
            }
        }

        Ok(account.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;
    use crate::users::InMemoryUserStore;
    use chrono::Utc;
    use serde_json::json;

    fn google_provider(client_id: &str) -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::Google,
            client_id: client_id.to_string(),
            client_secret: "secret".to_string(),
            authorization_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            jwks_url: Some("https://www.googleapis.com/oauth2/v3/certs".to_string()),
            profile_url: None,
            scopes: "openid profile email",
            algs: vec![Alg::RS256],
            uses_pkce: false,
            token_auth_basic: false,
            require_verified_email: true,
            issuer_check: IssuerCheck::AnyOf(vec![
                "https://accounts.google.com".to_string(),
                "accounts.google.com".to_string(),
            ]),
        }
    }

    fn google_fixture() -> (ProviderConfig, SigningKey, ProviderJwks) {
        let key = SigningKey::generate(Alg::RS256).unwrap();
        let jwks = ProviderJwks::from_document(&json!({ "keys": [key.public_jwk().unwrap().unwrap()] }), 600);
        (google_provider("test-client"), key, jwks)
    }

    fn google_claims() -> Value {
        let now = Utc::now().timestamp();
        json!({
            "iss": "https://accounts.google.com",
            "aud": "test-client",
            "sub": "google-user-123",
            "email": "user@gmail.com",
            "email_verified": true,
            "name": "Google User",
            "iat": now,
            "exp": now + 600,
        })
    }

    fn sign_with(key: &SigningKey, claims: &Value, kid: Option<&str>) -> String {
        jose::sign(claims, key.material(), Alg::RS256, kid).unwrap()
    }

    #[test]
    fn validates_google_id_token() {
        let (provider, key, jwks) = google_fixture();
        let token = sign_with(&key, &google_claims(), Some(&key.kid));

        let info = validate_id_token(&provider, &token, &jwks).unwrap();
        assert_eq!(info.sub, "google-user-123");
        assert_eq!(info.email.as_deref(), Some("user@gmail.com"));
        assert_eq!(info.email_verified, Some(true));
        assert_eq!(info.name.as_deref(), Some("Google User"));
    }

    #[test]
    fn rejects_wrong_issuer() {
        let (provider, key, jwks) = google_fixture();
        let mut claims = google_claims();
        claims["iss"] = json!("https://evil.com");
        let token = sign_with(&key, &claims, Some(&key.kid));

        let err = validate_id_token(&provider, &token, &jwks).unwrap_err();
        assert_eq!(err.message(), "Invalid token issuer");
    }

    #[test]
    fn accepts_bare_google_issuer() {
        let (provider, key, jwks) = google_fixture();
        let mut claims = google_claims();
        claims["iss"] = json!("accounts.google.com");
        let token = sign_with(&key, &claims, Some(&key.kid));

        assert!(validate_id_token(&provider, &token, &jwks).is_ok());
    }

    #[test]
    fn rejects_missing_kid() {
        let (provider, key, jwks) = google_fixture();
        let token = sign_with(&key, &google_claims(), None);

        let err = validate_id_token(&provider, &token, &jwks).unwrap_err();
        assert_eq!(err.message(), "Google ID token missing kid in header");
    }

    #[test]
    fn rejects_wrong_audience() {
        let (provider, key, jwks) = google_fixture();
        let mut claims = google_claims();
        claims["aud"] = json!("someone-else");
        let token = sign_with(&key, &claims, Some(&key.kid));

        let err = validate_id_token(&provider, &token, &jwks).unwrap_err();
        assert_eq!(err.message(), "Invalid token audience");
    }

    #[test]
    fn rejects_unadvertised_algorithm() {
        let (provider, _, _) = google_fixture();
        let es_key = SigningKey::generate(Alg::ES256).unwrap();
        let jwks = ProviderJwks::from_document(&json!({ "keys": [es_key.public_jwk().unwrap().unwrap()] }), 600);
        let token = jose::sign(&google_claims(), es_key.material(), Alg::ES256, Some(&es_key.kid)).unwrap();

        let err = validate_id_token(&provider, &token, &jwks).unwrap_err();
        assert_eq!(err.message(), "JWT algorithm mismatch");
    }

    #[test]
    fn rejects_unverified_email() {
        let (provider, key, jwks) = google_fixture();
        let mut claims = google_claims();
        claims["email_verified"] = json!(false);
        let token = sign_with(&key, &claims, Some(&key.kid));

        assert!(validate_id_token(&provider, &token, &jwks).is_err());
    }

    #[test]
    fn rejects_expired_id_token() {
        let (provider, key, jwks) = google_fixture();
        let mut claims = google_claims();
        claims["exp"] = json!(Utc::now().timestamp() - 10);
        let token = sign_with(&key, &claims, Some(&key.kid));

        let err = validate_id_token(&provider, &token, &jwks).unwrap_err();
        assert_eq!(err.message(), "JWT has expired");
    }

    #[test]
    fn microsoft_common_tenant_issuer_check() {
        let check = IssuerCheck::MicrosoftAnyTenant;
        let provider = ProviderConfig {
            issuer_check: check,
            ..google_provider("c")
        };
        assert!(provider.issuer_allowed("https://login.microsoftonline.com/9122040d-6c67-4c5b-b112-36a304b66dad/v2.0"));
        assert!(!provider.issuer_allowed("https://login.microsoftonline.com//v2.0"));
        assert!(!provider.issuer_allowed("https://evil.com/tenant/v2.0"));
        assert!(!provider.issuer_allowed("https://login.microsoftonline.com/a/b/v2.0"));
    }

    #[test]
    fn normalizes_facebook_profile() {
        let profile = json!({
            "id": "fb-321",
            "name": "Face Book",
            "email": "Person@Example.com",
            "first_name": "Face",
            "last_name": "Book",
            "picture": { "data": { "url": "https://cdn.example.com/p.jpg" } },
        });
        let info = normalize_facebook(&profile).unwrap();
        assert_eq!(info.sub, "fb-321");
        assert_eq!(info.email.as_deref(), Some("person@example.com"));
        assert_eq!(info.email_verified, Some(true));
        assert_eq!(info.picture.as_deref(), Some("https://cdn.example.com/p.jpg"));
    }

    #[test]
    fn normalizes_x_profile() {
        let profile = json!({
            "data": { "id": "x-99", "name": "Xavier", "username": "xav", "profile_image_url": "https://img" }
        });
        let info = normalize_x(&profile).unwrap();
        assert_eq!(info.sub, "x-99");
        assert!(info.email.is_none());
        assert_eq!(info.name.as_deref(), Some("Xavier"));
    }

    #[rocket::async_test]
    async fn authorize_url_persists_state_and_pkce_verifier() {
        let mut config = Config::for_tests("https://id.example.com");
        config.set_provider_credentials(
            "X",
            crate::config::ProviderCredentials {
                client_id: "x-client".to_string(),
                client_secret: "x-secret".to_string(),
            },
        );
        let repos = Repositories::in_memory();
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let sso = Sso::new(Arc::new(config), repos.clone(), users).unwrap();

        let url = sso.authorize_url(ProviderKind::X, Some("/after")).await.unwrap();
        let pairs: HashMap<String, String> =
            url.query_pairs().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "x-client");
        assert_eq!(pairs["redirect_uri"], "https://id.example.com/auth/x/callback");
        assert_eq!(pairs["code_challenge_method"], "S256");

        let row = repos.oauth_state.consume(&pairs["state"]).await.unwrap().expect("state row stored");
        assert_eq!(row.return_to, "/after");
        let verifier = row.code_verifier.expect("PKCE verifier stored");
        assert_eq!(
            pairs["code_challenge"],
            jose::b64url_encode(&crypto::sha256(verifier.as_bytes()))
        );
    }

    #[rocket::async_test]
    async fn unconfigured_provider_is_503() {
        let config = Config::for_tests("https://id.example.com");
        let repos = Repositories::in_memory();
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let sso = Sso::new(Arc::new(config), repos, users).unwrap();

        let err = sso.authorize_url(ProviderKind::Google, None).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
