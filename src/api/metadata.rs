//
// Discovery, JWKS, userinfo and liveness
//
use chrono::Utc;
use rocket::{
    request::{FromRequest, Outcome, Request},
    serde::json::Json,
    Route, State,
};
use serde_json::{json, Map, Value};

use crate::{
    api::JsonResult,
    clients::SUPPORTED_SCOPES,
    db::models::UserId,
    session::RequestInfo,
    users::profile_claims,
    util::Cached,
    Services,
};

pub fn routes() -> Vec<Route> {
    routes![openid_configuration, jwks, userinfo_get, userinfo_post, alive]
}

#[get("/.well-known/openid-configuration")]
fn openid_configuration(svc: &State<Services>) -> Json<Value> {
    let issuer = svc.config.issuer();

    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "revocation_endpoint": format!("{issuer}/revoke"),
        "introspection_endpoint": format!("{issuer}/introspect"),
        "end_session_endpoint": format!("{issuer}/end_session"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256", "ES256"],
        "scopes_supported": SUPPORTED_SCOPES,
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post", "none"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "claims_supported": [
            "sub", "iss", "aud", "exp", "iat", "auth_time",
            "email", "email_verified", "name", "given_name", "family_name", "picture"
        ],
    }))
}

#[get("/.well-known/jwks.json")]
fn jwks(svc: &State<Services>) -> Cached<Json<Value>> {
    Cached::short(Json(svc.keys.jwks()), false)
}

/// Bearer token, if one was presented. Validation happens in the handler so
/// the 401 can carry the RFC 6750 challenge.
pub struct BearerToken(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|header| header.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        Outcome::Success(BearerToken(token))
    }
}

async fn userinfo(bearer: BearerToken, info: RequestInfo, svc: &Services) -> JsonResult {
    info.enforce_https(&svc.config)?;

    const CHALLENGE: &str = "Bearer error=\"invalid_token\"";
    let Some(token) = bearer.0 else {
        return Err(crate::error::Error::new("invalid_token", "Bearer token required")
            .with_www_authenticate(CHALLENGE));
    };
    let claims =
        svc.tokens.verify_access_token(&token).map_err(|e| e.with_www_authenticate(CHALLENGE))?;

    let sub = UserId::from(claims.sub.clone());
    let scopes: Vec<String> = claims.scope.split_whitespace().map(str::to_string).collect();

    let mut body = Map::new();
    body.insert("sub".into(), json!(claims.sub));
    if let Some(account) = svc.users.get_account(&sub).await? {
        let contact = svc.users.email_contact(&sub).await?;
        body.extend(profile_claims(&account, contact.as_ref(), &scopes));
    }

    Ok(Json(Value::Object(body)))
}

#[get("/userinfo")]
async fn userinfo_get(bearer: BearerToken, info: RequestInfo, svc: &State<Services>) -> JsonResult {
    userinfo(bearer, info, svc).await
}

#[post("/userinfo")]
async fn userinfo_post(bearer: BearerToken, info: RequestInfo, svc: &State<Services>) -> JsonResult {
    userinfo(bearer, info, svc).await
}

#[get("/alive")]
fn alive() -> Json<String> {
    Json(Utc::now().to_rfc3339())
}
