use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display, From)]
#[deref(forward)]
#[from(forward)]
pub struct ClientId(String);

impl ClientId {
    pub fn random() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }
}

// Path parameters (`/clients/<id>`) only resolve when they look like a UUID,
// so malformed ids 404 before touching the registry.
impl<'r> rocket::request::FromParam<'r> for ClientId {
    type Error = ();

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        match uuid::Uuid::parse_str(param) {
            Ok(_) => Ok(ClientId(param.to_string())),
            Err(_) => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

impl GrantType {
    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "authorization_code" => Some(GrantType::AuthorizationCode),
            "refresh_token" => Some(GrantType::RefreshToken),
            "client_credentials" => Some(GrantType::ClientCredentials),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::ClientCredentials => "client_credentials",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Code,
    Token,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenEndpointAuthMethod::ClientSecretBasic => "client_secret_basic",
            TokenEndpointAuthMethod::ClientSecretPost => "client_secret_post",
            TokenEndpointAuthMethod::None => "none",
        }
    }
}

/// A registered relying party.
#[derive(Clone, Debug)]
pub struct Client {
    pub uuid: ClientId,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub response_types: Vec<ResponseType>,
    pub scopes: Vec<String>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    // None iff the auth method is `none`; the plaintext secret is returned
    // exactly once, at registration.
    pub secret_hash: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        redirect_uris: Vec<String>,
        grant_types: Vec<GrantType>,
        response_types: Vec<ResponseType>,
        scopes: Vec<String>,
        token_endpoint_auth_method: TokenEndpointAuthMethod,
        secret_hash: Option<String>,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: ClientId::random(),
            name,
            redirect_uris,
            grant_types,
            response_types,
            scopes,
            token_endpoint_auth_method,
            secret_hash,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == TokenEndpointAuthMethod::None
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    pub fn allows_response_type(&self, response_type: ResponseType) -> bool {
        self.response_types.contains(&response_type)
    }

    /// Exact string containment; no prefix, wildcard or normalization rules.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    // The secret hash stays server-side
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "name": self.name,
            "redirectUris": self.redirect_uris,
            "grantTypes": self.grant_types,
            "responseTypes": self.response_types,
            "scopes": self.scopes,
            "tokenEndpointAuthMethod": self.token_endpoint_auth_method,
            "createdAt": self.created_at.and_utc().timestamp(),
            "updatedAt": self.updated_at.and_utc().timestamp(),
        })
    }
}
