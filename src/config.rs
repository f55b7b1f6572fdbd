use url::Url;

use crate::{
    crypto,
    error::Error,
    jose::Alg,
    util::{get_env, get_env_str_value},
};

// Every duration is in seconds.
const DEFAULT_ACCESS_TOKEN_TTL: i64 = 900;
const DEFAULT_ID_TOKEN_TTL: i64 = 900;
const DEFAULT_REFRESH_TOKEN_TTL: i64 = 2_592_000; // 30 days
const DEFAULT_AUTH_CODE_TTL: i64 = 60;
const DEFAULT_SESSION_TTL: i64 = 900;
const DEFAULT_OAUTH_STATE_TTL: i64 = 600;

#[derive(Clone, Debug)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Process configuration, loaded once from the environment at startup.
///
/// There is intentionally no global: `main` builds one `Config`, wraps it in
/// an `Arc` and hands it to every service constructor. Tests construct their
/// own instance instead of poking a cache-clearing hook.
#[derive(Clone, Debug)]
pub struct Config {
    issuer: String,
    default_audience: Option<String>,
    port: u16,
    production: bool,

    session_secret: Vec<u8>,
    signing_alg: Alg,

    access_token_ttl: i64,
    id_token_ttl: i64,
    refresh_token_ttl: i64,
    auth_code_ttl: i64,
    session_ttl: i64,
    oauth_state_ttl: i64,

    google: Option<ProviderCredentials>,
    microsoft: Option<ProviderCredentials>,
    facebook: Option<ProviderCredentials>,
    x: Option<ProviderCredentials>,
    microsoft_tenant: String,

    log_level: String,
    log_file: Option<String>,
}

fn provider_credentials(prefix: &str) -> Option<ProviderCredentials> {
    let client_id = get_env_str_value(&format!("{prefix}_CLIENT_ID"))?;
    let client_secret = get_env_str_value(&format!("{prefix}_CLIENT_SECRET"))?;
    Some(ProviderCredentials {
        client_id,
        client_secret,
    })
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        // Loading the env file is optional; deployments usually use real env vars
        dotenvy::dotenv().ok();

        let port: u16 = get_env("PORT").unwrap_or(8080);
        let issuer =
            get_env_str_value("OIDC_ISSUER").unwrap_or_else(|| format!("http://localhost:{port}"));
        let issuer = issuer.trim_end_matches('/').to_string();
        let parsed = Url::parse(&issuer)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            err!(format!("OIDC_ISSUER must be an http(s) URL, got {issuer}"));
        }

        let session_secret = match get_env_str_value("SESSION_SECRET") {
            Some(secret) => secret.into_bytes(),
            None => {
                warn!("SESSION_SECRET not set, generating an ephemeral one; sessions will not survive a restart");
                crypto::get_random_bytes::<64>().to_vec()
            }
        };

        let signing_alg = match get_env_str_value("SIGNING_ALG") {
            Some(raw) => match Alg::from_str(&raw) {
                Some(alg) if !alg.is_hmac() => alg,
                _ => err!(format!("SIGNING_ALG must be an RS* or ES* algorithm, got {raw}")),
            },
            None => Alg::RS256,
        };

        Ok(Config {
            issuer,
            default_audience: get_env_str_value("OIDC_DEFAULT_AUDIENCE"),
            port,
            production: matches!(get_env_str_value("NODE_ENV").as_deref(), Some("production")),
            session_secret,
            signing_alg,
            access_token_ttl: get_env("ACCESS_TOKEN_TTL").unwrap_or(DEFAULT_ACCESS_TOKEN_TTL),
            id_token_ttl: get_env("ID_TOKEN_TTL").unwrap_or(DEFAULT_ID_TOKEN_TTL),
            refresh_token_ttl: get_env("REFRESH_TOKEN_TTL").unwrap_or(DEFAULT_REFRESH_TOKEN_TTL),
            auth_code_ttl: get_env("AUTH_CODE_TTL").unwrap_or(DEFAULT_AUTH_CODE_TTL),
            session_ttl: get_env("SESSION_TTL").unwrap_or(DEFAULT_SESSION_TTL),
            oauth_state_ttl: get_env("OAUTH_STATE_TTL").unwrap_or(DEFAULT_OAUTH_STATE_TTL),
            google: provider_credentials("GOOGLE"),
            microsoft: provider_credentials("MICROSOFT"),
            facebook: provider_credentials("FACEBOOK"),
            x: provider_credentials("X"),
            microsoft_tenant: get_env_str_value("MICROSOFT_TENANT").unwrap_or_else(|| "common".to_string()),
            log_level: get_env_str_value("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: get_env_str_value("LOG_FILE"),
        })
    }

    /// A config for tests: fixed issuer and secret, no providers from env.
    pub fn for_tests(issuer: &str) -> Self {
        Config {
            issuer: issuer.trim_end_matches('/').to_string(),
            default_audience: None,
            port: 8080,
            production: false,
            session_secret: b"test-session-secret-test-session-secret".to_vec(),
            signing_alg: Alg::RS256,
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            id_token_ttl: DEFAULT_ID_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            auth_code_ttl: DEFAULT_AUTH_CODE_TTL,
            session_ttl: DEFAULT_SESSION_TTL,
            oauth_state_ttl: DEFAULT_OAUTH_STATE_TTL,
            google: None,
            microsoft: None,
            facebook: None,
            x: None,
            microsoft_tenant: "common".to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn default_audience(&self) -> Option<&str> {
        self.default_audience.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn production(&self) -> bool {
        self.production
    }

    pub fn session_secret(&self) -> &[u8] {
        &self.session_secret
    }

    pub fn signing_alg(&self) -> Alg {
        self.signing_alg
    }

    pub fn access_token_ttl(&self) -> i64 {
        self.access_token_ttl
    }

    pub fn id_token_ttl(&self) -> i64 {
        self.id_token_ttl
    }

    pub fn refresh_token_ttl(&self) -> i64 {
        self.refresh_token_ttl
    }

    pub fn auth_code_ttl(&self) -> i64 {
        self.auth_code_ttl
    }

    pub fn session_ttl(&self) -> i64 {
        self.session_ttl
    }

    pub fn oauth_state_ttl(&self) -> i64 {
        self.oauth_state_ttl
    }

    pub fn google(&self) -> Option<&ProviderCredentials> {
        self.google.as_ref()
    }

    pub fn microsoft(&self) -> Option<&ProviderCredentials> {
        self.microsoft.as_ref()
    }

    pub fn facebook(&self) -> Option<&ProviderCredentials> {
        self.facebook.as_ref()
    }

    pub fn x(&self) -> Option<&ProviderCredentials> {
        self.x.as_ref()
    }

    pub fn microsoft_tenant(&self) -> &str {
        &self.microsoft_tenant
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn log_file(&self) -> Option<&str> {
        self.log_file.as_deref()
    }

    /// `{issuer}/auth/<provider>/callback`, registered verbatim at each provider.
    pub fn provider_redirect_uri(&self, provider_id: &str) -> String {
        format!("{}/auth/{provider_id}/callback", self.issuer)
    }

    #[cfg(test)]
    pub fn set_production(&mut self, production: bool) {
        self.production = production;
    }

    #[cfg(test)]
    pub fn set_provider_credentials(&mut self, prefix: &str, creds: ProviderCredentials) {
        match prefix {
            "GOOGLE" => self.google = Some(creds),
            "MICROSOFT" => self.microsoft = Some(creds),
            "FACEBOOK" => self.facebook = Some(creds),
            _ => self.x = Some(creds),
        }
    }
}
