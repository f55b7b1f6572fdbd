//
// Client registry
//
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use url::Url;

use crate::{
    api::ApiResult,
    crypto,
    db::{
        models::{Client, ClientId, GrantType, ResponseType, TokenEndpointAuthMethod},
        ClientRepo,
    },
};

pub const SUPPORTED_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

/// Registration / update input. Accepts both camelCase (the public API
/// surface) and snake_case field names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientData {
    pub name: Option<String>,
    #[serde(alias = "redirect_uris")]
    pub redirect_uris: Option<Vec<String>>,
    #[serde(alias = "grant_types")]
    pub grant_types: Option<Vec<String>>,
    #[serde(alias = "response_types")]
    pub response_types: Option<Vec<String>>,
    pub scopes: Option<Vec<String>>,
    #[serde(alias = "token_endpoint_auth_method")]
    pub token_endpoint_auth_method: Option<String>,
}

/// Returned from `register` only: the single moment the plaintext secret is
/// visible.
pub struct ClientWithSecret {
    pub client: Client,
    pub client_secret: Option<String>,
}

pub struct ClientRegistry {
    repo: Arc<dyn ClientRepo>,
}

impl ClientRegistry {
    pub fn new(repo: Arc<dyn ClientRepo>) -> Self {
        Self {
            repo,
        }
    }

    pub async fn register(&self, data: RegisterClientData) -> ApiResult<ClientWithSecret> {
        let name = match data.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => err!("Client name cannot be blank"),
        };

        let redirect_uris = validate_redirect_uris(data.redirect_uris.unwrap_or_default())?;
        let grant_types = parse_grant_types(data.grant_types)?;
        let response_types = parse_response_types(data.response_types)?;
        let scopes = parse_scopes(data.scopes)?;
        let auth_method = parse_auth_method(data.token_endpoint_auth_method.as_deref())?;

        let (secret, secret_hash) = if auth_method == TokenEndpointAuthMethod::None {
            (None, None)
        } else {
            let secret = crypto::generate_token();
            let hash = crypto::sha256_hex(secret.as_bytes());
            (Some(secret), Some(hash))
        };

        let client = Client::new(name, redirect_uris, grant_types, response_types, scopes, auth_method, secret_hash);

        if !self.repo.insert_if_absent(&client).await? {
            err_code!("invalid_request", "Client id collision", 409);
        }

        Ok(ClientWithSecret {
            client,
            client_secret: secret,
        })
    }

    /// Active clients only; a deactivated client is indistinguishable from a
    /// nonexistent one.
    pub async fn get(&self, id: &ClientId) -> ApiResult<Option<Client>> {
        Ok(self.repo.get(id).await?.filter(|client| client.is_active))
    }

    pub async fn list(&self) -> ApiResult<Vec<Client>> {
        let mut clients: Vec<Client> =
            self.repo.list().await?.into_iter().filter(|client| client.is_active).collect();
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(clients)
    }

    /// Constant-time secret check against the stored SHA-256.
    pub async fn authenticate(&self, id: &ClientId, secret: &str) -> ApiResult<Client> {
        let Some(client) = self.get(id).await? else {
            err!("invalid_client", "Client authentication failed");
        };
        let Some(secret_hash) = &client.secret_hash else {
            err!("invalid_client", "Client has no secret");
        };
        if !crypto::ct_eq(crypto::sha256_hex(secret.as_bytes()), secret_hash) {
            err!("invalid_client", "Client authentication failed");
        }
        Ok(client)
    }

    pub async fn update(&self, id: &ClientId, patch: RegisterClientData) -> ApiResult<Client> {
        let Some(mut client) = self.get(id).await? else {
            err_code!("invalid_request", "Client not found", 404);
        };

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                err!("Client name cannot be blank");
            }
            client.name = name.trim().to_string();
        }
        if let Some(uris) = patch.redirect_uris {
            client.redirect_uris = validate_redirect_uris(uris)?;
        }
        if patch.grant_types.is_some() {
            client.grant_types = parse_grant_types(patch.grant_types)?;
        }
        if patch.response_types.is_some() {
            client.response_types = parse_response_types(patch.response_types)?;
        }
        if patch.scopes.is_some() {
            client.scopes = parse_scopes(patch.scopes)?;
        }
        if let Some(method) = patch.token_endpoint_auth_method.as_deref() {
            let method = parse_auth_method(Some(method))?;
            if method == TokenEndpointAuthMethod::None {
                client.secret_hash = None;
            } else if client.secret_hash.is_none() {
                err!("Cannot switch a public client to a confidential auth method without re-registering");
            }
            client.token_endpoint_auth_method = method;
        }

        client.updated_at = Utc::now().naive_utc();
        if !self.repo.replace(&client).await? {
            err_code!("invalid_request", "Client not found", 404);
        }
        Ok(client)
    }

    pub async fn deactivate(&self, id: &ClientId) -> ApiResult<()> {
        let Some(mut client) = self.get(id).await? else {
            err_code!("invalid_request", "Client not found", 404);
        };
        client.is_active = false;
        client.updated_at = Utc::now().naive_utc();
        self.repo.replace(&client).await?;
        Ok(())
    }

    pub async fn is_redirect_uri_allowed(&self, id: &ClientId, uri: &str) -> ApiResult<bool> {
        Ok(self.get(id).await?.map(|client| client.is_redirect_uri_allowed(uri)).unwrap_or(false))
    }

    /// Requested scopes must be registered for the client and supported by
    /// the server; returns the offenders for the error description.
    pub fn validate_scopes(client: &Client, requested: &[String]) -> (bool, Vec<String>) {
        let invalid: Vec<String> = requested
            .iter()
            .filter(|scope| {
                !client.scopes.iter().any(|s| s == *scope) || !SUPPORTED_SCOPES.contains(&scope.as_str())
            })
            .cloned()
            .collect();
        (invalid.is_empty(), invalid)
    }
}

fn validate_redirect_uris(uris: Vec<String>) -> ApiResult<Vec<String>> {
    if uris.is_empty() {
        err!("redirect_uris cannot be empty");
    }
    for uri in &uris {
        let parsed = match Url::parse(uri) {
            Ok(parsed) => parsed,
            Err(_) => err!(format!("Invalid redirect URI: {uri}")),
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            err!(format!("Redirect URI must be http or https: {uri}"));
        }
    }
    Ok(uris)
}

fn parse_grant_types(raw: Option<Vec<String>>) -> ApiResult<Vec<GrantType>> {
    let raw = raw.unwrap_or_else(|| vec!["authorization_code".to_string()]);
    if raw.is_empty() {
        err!("grant_types cannot be empty");
    }
    let mut grants = Vec::with_capacity(raw.len());
    for value in &raw {
        match GrantType::from_param(value) {
            Some(grant) if !grants.contains(&grant) => grants.push(grant),
            Some(_) => {}
            None => err!(format!("Unsupported grant type: {value}")),
        }
    }
    Ok(grants)
}

fn parse_response_types(raw: Option<Vec<String>>) -> ApiResult<Vec<ResponseType>> {
    let raw = raw.unwrap_or_else(|| vec!["code".to_string()]);
    if raw.is_empty() {
        err!("response_types cannot be empty");
    }
    let mut types = Vec::with_capacity(raw.len());
    for value in &raw {
        match value.as_str() {
            "code" => {
                if !types.contains(&ResponseType::Code) {
                    types.push(ResponseType::Code);
                }
            }
            "token" => {
                if !types.contains(&ResponseType::Token) {
                    types.push(ResponseType::Token);
                }
            }
            _ => err!(format!("Unsupported response type: {value}")),
        }
    }
    Ok(types)
}

fn parse_scopes(raw: Option<Vec<String>>) -> ApiResult<Vec<String>> {
    let raw = raw.unwrap_or_else(|| vec!["openid".to_string()]);
    if raw.is_empty() {
        err!("scopes cannot be empty");
    }
    for scope in &raw {
        if !SUPPORTED_SCOPES.contains(&scope.as_str()) {
            err!(format!("Unsupported scope: {scope}"));
        }
    }
    Ok(raw)
}

fn parse_auth_method(raw: Option<&str>) -> ApiResult<TokenEndpointAuthMethod> {
    match raw {
        None | Some("client_secret_basic") => Ok(TokenEndpointAuthMethod::ClientSecretBasic),
        Some("client_secret_post") => Ok(TokenEndpointAuthMethod::ClientSecretPost),
        Some("none") => Ok(TokenEndpointAuthMethod::None),
        Some(other) => err!(format!("Unsupported token endpoint auth method: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repositories;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Repositories::in_memory().clients)
    }

    fn register_data() -> RegisterClientData {
        RegisterClientData {
            name: Some("Test RP".to_string()),
            redirect_uris: Some(vec!["https://rp.example.com/cb".to_string()]),
            grant_types: Some(vec!["authorization_code".to_string(), "refresh_token".to_string()]),
            response_types: Some(vec!["code".to_string()]),
            scopes: Some(vec!["openid".to_string(), "offline_access".to_string()]),
            token_endpoint_auth_method: None,
        }
    }

    #[rocket::async_test]
    async fn register_returns_secret_exactly_once() {
        let registry = registry();
        let registered = registry.register(register_data()).await.unwrap();

        let secret = registered.client_secret.expect("confidential client gets a secret");
        assert_eq!(
            registered.client.secret_hash.as_deref(),
            Some(crypto::sha256_hex(secret.as_bytes()).as_str())
        );
        // the stored record never carries the plaintext
        let fetched = registry.get(&registered.client.uuid).await.unwrap().unwrap();
        assert_eq!(fetched.to_json().get("secretHash"), None);
        assert_eq!(fetched.to_json().get("clientSecret"), None);
    }

    #[rocket::async_test]
    async fn public_clients_have_no_secret() {
        let registry = registry();
        let mut data = register_data();
        data.token_endpoint_auth_method = Some("none".to_string());
        let registered = registry.register(data).await.unwrap();

        assert!(registered.client_secret.is_none());
        assert!(registered.client.secret_hash.is_none());
        assert!(registered.client.is_public());
    }

    #[rocket::async_test]
    async fn authenticate_checks_the_secret() {
        let registry = registry();
        let registered = registry.register(register_data()).await.unwrap();
        let id = registered.client.uuid.clone();
        let secret = registered.client_secret.unwrap();

        assert!(registry.authenticate(&id, &secret).await.is_ok());
        let err = registry.authenticate(&id, "wrong-secret").await.unwrap_err();
        assert_eq!(err.error(), "invalid_client");
    }

    #[rocket::async_test]
    async fn deactivated_clients_disappear() {
        let registry = registry();
        let registered = registry.register(register_data()).await.unwrap();
        let id = registered.client.uuid.clone();

        registry.deactivate(&id).await.unwrap();
        assert!(registry.get(&id).await.unwrap().is_none());
        assert!(!registry.is_redirect_uri_allowed(&id, "https://rp.example.com/cb").await.unwrap());
    }

    #[rocket::async_test]
    async fn validation_rejects_bad_input() {
        let registry = registry();

        let mut data = register_data();
        data.redirect_uris = Some(vec![]);
        assert!(registry.register(data).await.is_err());

        let mut data = register_data();
        data.redirect_uris = Some(vec!["not-a-url".to_string()]);
        assert!(registry.register(data).await.is_err());

        let mut data = register_data();
        data.redirect_uris = Some(vec!["ftp://rp.example.com/cb".to_string()]);
        assert!(registry.register(data).await.is_err());

        let mut data = register_data();
        data.scopes = Some(vec!["openid".to_string(), "admin".to_string()]);
        assert!(registry.register(data).await.is_err());

        let mut data = register_data();
        data.name = Some("  ".to_string());
        assert!(registry.register(data).await.is_err());
    }

    #[rocket::async_test]
    async fn scope_validation_reports_offenders() {
        let registry = registry();
        let client = registry.register(register_data()).await.unwrap().client;

        let (ok, invalid) =
            ClientRegistry::validate_scopes(&client, &["openid".to_string(), "offline_access".to_string()]);
        assert!(ok && invalid.is_empty());

        let (ok, invalid) = ClientRegistry::validate_scopes(&client, &["openid".to_string(), "email".to_string()]);
        assert!(!ok);
        assert_eq!(invalid, vec!["email".to_string()]);
    }
}
