//
// RP-initiated logout
//
use rocket::{http::CookieJar, response::Redirect, Route, State};
use serde_json::Value;
use url::Url;

use crate::{db::models::ClientId, session::RequestInfo, Services};

pub fn routes() -> Vec<Route> {
    routes![end_session]
}

/// The redirect target is honored only when a valid `id_token_hint` proves
/// the request comes from a client we issued tokens to AND the URI is
/// registered for that client; everything else lands on the login page.
async fn logout_target(
    svc: &Services,
    post_logout_redirect_uri: Option<&str>,
    id_token_hint: Option<&str>,
    state: Option<&str>,
) -> String {
    let fallback = format!("{}/login", svc.config.issuer());

    let (Some(uri), Some(hint)) = (post_logout_redirect_uri, id_token_hint) else {
        return fallback;
    };

    let Ok(jws) = svc.tokens.verify_local_jwt(hint) else {
        return fallback;
    };
    let Some(aud) = jws.payload.get("aud").and_then(Value::as_str) else {
        return fallback;
    };

    let client = match svc.clients.get(&ClientId::from(aud)).await {
        Ok(Some(client)) => client,
        _ => return fallback,
    };
    if !client.is_redirect_uri_allowed(uri) {
        return fallback;
    }

    let Ok(mut url) = Url::parse(uri) else {
        return fallback;
    };
    if let Some(state) = state {
        url.query_pairs_mut().append_pair("state", state);
    }
    url.to_string()
}

#[get("/end_session?<post_logout_redirect_uri>&<id_token_hint>&<state>")]
async fn end_session(
    post_logout_redirect_uri: Option<String>,
    id_token_hint: Option<String>,
    state: Option<String>,
    info: RequestInfo,
    jar: &CookieJar<'_>,
    svc: &State<Services>,
) -> Redirect {
    // The session ends unconditionally, wherever the redirect goes
    jar.add(svc.sessions.removal_cookie(info.secure));

    let target = logout_target(
        svc,
        post_logout_redirect_uri.as_deref(),
        id_token_hint.as_deref(),
        state.as_deref(),
    )
    .await;

    Redirect::found(target)
}
