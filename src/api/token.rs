//
// Token, revocation and introspection endpoints
//
use data_encoding::BASE64;
use percent_encoding::percent_decode_str;
use rocket::{
    form::Form,
    request::{FromRequest, Outcome, Request},
    serde::json::Json,
    Route, State,
};
use serde_json::json;

use crate::{
    api::{ApiResult, JsonResult},
    crypto,
    db::{
        models::{Client, ClientId, CodeChallengeMethod, GrantType, TokenEndpointAuthMethod},
        CodeConsume,
    },
    jose,
    session::RequestInfo,
    util::security_event,
    Services,
};

pub fn routes() -> Vec<Route> {
    routes![token, revoke, introspect]
}

const BASIC_CHALLENGE: &str = "Basic realm=\"keygate\"";

/// `Authorization: Basic` credentials, split and URL-decoded per RFC 6749
/// §2.3.1. `None` when the header is absent or not Basic.
pub struct BasicAuth(Option<(String, String)>);

impl BasicAuth {
    fn attempted(&self) -> bool {
        self.0.is_some()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BasicAuth {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let parsed = request
            .headers()
            .get_one("Authorization")
            .and_then(|header| header.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded.trim().as_bytes()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                let (id, secret) = pair.split_once(':')?;
                Some((
                    percent_decode_str(id).decode_utf8().ok()?.to_string(),
                    percent_decode_str(secret).decode_utf8().ok()?.to_string(),
                ))
            });

        Outcome::Success(BasicAuth(parsed))
    }
}

/// Client authentication, in precedence order: HTTP Basic, then secret in the
/// form body, then bare `client_id` for public clients.
async fn authenticate_client(
    svc: &Services,
    basic: &BasicAuth,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> ApiResult<Client> {
    if let Some((id, secret)) = &basic.0 {
        return svc
            .clients
            .authenticate(&ClientId::from(id.clone()), secret)
            .await
            .map_err(|e| e.with_www_authenticate(BASIC_CHALLENGE));
    }

    match (client_id, client_secret) {
        (Some(id), Some(secret)) => svc.clients.authenticate(&ClientId::from(id), secret).await,
        (Some(id), None) => {
            let Some(client) = svc.clients.get(&ClientId::from(id)).await? else {
                err!("invalid_client", "Client authentication failed");
            };
            if client.token_endpoint_auth_method != TokenEndpointAuthMethod::None {
                err!("invalid_client", "Client authentication required");
            }
            Ok(client)
        }
        _ => err!("invalid_client", "Client authentication required"),
    }
}

#[derive(Debug, FromForm)]
struct TokenRequest {
    grant_type: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    scope: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[post("/token", data = "<data>")]
async fn token(
    data: Form<TokenRequest>,
    basic: BasicAuth,
    info: RequestInfo,
    svc: &State<Services>,
) -> JsonResult {
    info.enforce_https(&svc.config)?;
    let data = data.into_inner();
    let basic_attempted = basic.attempted();

    let client = authenticate_client(svc, &basic, data.client_id.as_deref(), data.client_secret.as_deref()).await?;

    let result = match data.grant_type.as_deref() {
        Some("authorization_code") => grant_authorization_code(svc, &client, &data).await,
        Some("refresh_token") => grant_refresh_token(svc, &client, &data).await,
        Some("client_credentials") => grant_client_credentials(svc, &client, &data).await,
        _ => err!("unsupported_grant_type", "Unknown or missing grant_type"),
    };

    match result {
        Ok(body) => Ok(body),
        Err(e) if basic_attempted && e.error() == "invalid_client" => {
            Err(e.with_www_authenticate(BASIC_CHALLENGE))
        }
        Err(e) => Err(e),
    }
}

async fn grant_authorization_code(svc: &Services, client: &Client, data: &TokenRequest) -> JsonResult {
    let Some(code) = data.code.as_deref() else {
        err!("invalid_grant", "code cannot be blank");
    };

    let row = match svc.repos.auth_codes.consume(code).await? {
        CodeConsume::Applied(row) => row,
        CodeConsume::Missing => err!("invalid_grant", "Invalid or expired authorization code"),
        CodeConsume::Replayed(row) => {
            // Single-use violated: kill everything the first exchange produced
            let since = row.consumed_at.unwrap_or(row.created_at);
            let revoked =
                svc.repos.refresh_tokens.revoke_issued_since(&row.client_id, &row.user_sub, since).await?;
            security_event(
                "token_revoked",
                &[
                    ("user_id", Some(&row.user_sub.to_string())),
                    ("client_id", Some(&row.client_id.to_string())),
                    ("reason", Some("authorization_code_replay")),
                    ("revoked", Some(&revoked.to_string())),
                ],
            );
            err!("invalid_grant", "Authorization code has already been used");
        }
    };

    if row.client_id != client.uuid {
        err!("invalid_grant", "Authorization code was issued to another client");
    }
    if data.redirect_uri.as_deref() != Some(row.redirect_uri.as_str()) {
        err!("invalid_grant", "redirect_uri does not match the authorization request");
    }

    if let Some(challenge) = &row.code_challenge {
        let Some(verifier) = data.code_verifier.as_deref() else {
            err!("invalid_grant", "code_verifier is required");
        };
        let verified = match row.code_challenge_method.unwrap_or(CodeChallengeMethod::S256) {
            CodeChallengeMethod::Plain => crypto::ct_eq(verifier, challenge),
            CodeChallengeMethod::S256 => {
                crypto::ct_eq(jose::b64url_encode(&crypto::sha256(verifier.as_bytes())), challenge)
            }
        };
        if !verified {
            err!("invalid_grant", "PKCE verification failed");
        }
    }

    if !client.allows_grant(GrantType::AuthorizationCode) {
        err!("unauthorized_client", "Client may not use the authorization code grant");
    }

    let issued =
        svc.tokens.issue(client, &row.user_sub, &row.scopes, row.nonce.as_deref(), row.auth_time).await?;
    Ok(Json(issued.to_json()))
}

async fn grant_refresh_token(svc: &Services, client: &Client, data: &TokenRequest) -> JsonResult {
    let Some(refresh_token) = data.refresh_token.as_deref() else {
        err!("invalid_grant", "refresh_token cannot be blank");
    };
    if !client.allows_grant(GrantType::RefreshToken) {
        err!("unauthorized_client", "Client may not use the refresh token grant");
    }

    let requested_scopes = data
        .scope
        .as_deref()
        .map(|scope| scope.split_whitespace().map(str::to_string).collect::<Vec<_>>());

    let issued = svc.tokens.rotate_refresh(client, refresh_token, requested_scopes).await?;
    Ok(Json(issued.to_json()))
}

async fn grant_client_credentials(svc: &Services, client: &Client, data: &TokenRequest) -> JsonResult {
    if client.is_public() {
        err!("unauthorized_client", "Public clients may not use the client credentials grant");
    }
    if !client.allows_grant(GrantType::ClientCredentials) {
        err!("unauthorized_client", "Client may not use the client credentials grant");
    }

    let scopes = match data.scope.as_deref() {
        None => client.scopes.iter().filter(|scope| *scope != "offline_access").cloned().collect::<Vec<_>>(),
        Some(raw) => {
            let requested: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            let (ok, invalid) = crate::clients::ClientRegistry::validate_scopes(client, &requested);
            if !ok {
                err!("invalid_scope", format!("Scopes not available to this client: {}", invalid.join(" ")));
            }
            requested
        }
    };

    let issued = svc.tokens.issue_client_credentials(client, &scopes).await?;
    Ok(Json(issued.to_json()))
}

//
// RFC 7009 revocation
//

#[derive(Debug, FromForm)]
struct RevocationRequest {
    token: Option<String>,
    #[field(name = "token_type_hint")]
    _token_type_hint: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[post("/revoke", data = "<data>")]
async fn revoke(data: Form<RevocationRequest>, basic: BasicAuth, info: RequestInfo, svc: &State<Services>) -> JsonResult {
    info.enforce_https(&svc.config)?;
    let data = data.into_inner();

    let client = authenticate_client(svc, &basic, data.client_id.as_deref(), data.client_secret.as_deref()).await?;
    let Some(token) = data.token.as_deref() else {
        err!("token cannot be blank");
    };

    // Unknown or non-revokable tokens still get 200 {} (RFC 7009 §2.2)
    svc.tokens.revoke(token, &client).await?;
    Ok(Json(json!({})))
}

//
// RFC 7662 introspection
//

#[derive(Debug, FromForm)]
struct IntrospectionRequest {
    token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[post("/introspect", data = "<data>")]
async fn introspect(
    data: Form<IntrospectionRequest>,
    basic: BasicAuth,
    info: RequestInfo,
    svc: &State<Services>,
) -> JsonResult {
    info.enforce_https(&svc.config)?;
    let data = data.into_inner();

    authenticate_client(svc, &basic, data.client_id.as_deref(), data.client_secret.as_deref()).await?;
    let Some(token) = data.token.as_deref() else {
        err!("token cannot be blank");
    };

    Ok(Json(svc.tokens.introspect(token).await?))
}
