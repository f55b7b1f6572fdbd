//
// Federated login routes
//
use rocket::{http::CookieJar, response::Redirect, Route, State};

use crate::{
    api::ApiResult,
    session::RequestInfo,
    sso::ProviderKind,
    util::security_event,
    Services,
};

pub fn routes() -> Vec<Route> {
    routes![start, callback]
}

#[get("/auth/<provider>?<return_to>")]
async fn start(
    provider: ProviderKind,
    return_to: Option<String>,
    info: RequestInfo,
    svc: &State<Services>,
) -> ApiResult<Redirect> {
    info.enforce_https(&svc.config)?;
    let url = svc.sso.authorize_url(provider, return_to.as_deref()).await?;
    Ok(Redirect::found(url.to_string()))
}

#[get("/auth/<provider>/callback?<code>&<state>&<error>&<error_description>")]
async fn callback(
    provider: ProviderKind,
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    info: RequestInfo,
    jar: &CookieJar<'_>,
    svc: &State<Services>,
) -> ApiResult<Redirect> {
    info.enforce_https(&svc.config)?;

    if let Some(error) = error {
        security_event("auth_failure", &[("provider", Some(provider.id())), ("reason", Some(&error))]);
        err!(
            "access_denied",
            format!("{provider} authorization failed: {error} {}", error_description.unwrap_or_default())
        );
    }

    let (Some(code), Some(state)) = (code, state) else {
        err!("Missing code or state in provider callback");
    };

    let (sub, return_to) = svc.sso.handle_callback(provider, &state, &code).await?;

    let token = svc.sessions.issue(&sub)?;
    jar.add(svc.sessions.cookie(token, info.secure));

    Ok(Redirect::found(return_to))
}
