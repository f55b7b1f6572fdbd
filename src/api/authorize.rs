//
// Authorization endpoint and the local login surface
//
use rocket::{
    form::Form,
    http::CookieJar,
    response::{content::RawHtml, Redirect},
    response::{self, Responder},
    request::Request,
    Route, State,
};
use url::Url;

use crate::{
    api::{ApiResult, ClientIp},
    db::models::{AuthorizationCode, CodeChallengeMethod, ClientId, GrantType, ResponseType},
    session::{sanitize_return_to, RequestInfo, Session},
    util::{security_event, HtmlErrorPage},
    Services,
};

pub fn routes() -> Vec<Route> {
    routes![authorize, login_page, login]
}

#[derive(Debug, FromForm)]
pub struct AuthorizeQuery {
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_type: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    nonce: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    prompt: Option<String>,
}

/// The two shapes an authorization response can take: a 302, or an inline
/// HTML error page for failures detected before the redirect URI was proven
/// trustworthy.
pub enum AuthorizeResponse {
    Redirect(Box<Redirect>),
    ErrorPage(HtmlErrorPage),
}

impl<'r> Responder<'r, 'static> for AuthorizeResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        match self {
            AuthorizeResponse::Redirect(redirect) => redirect.respond_to(req),
            AuthorizeResponse::ErrorPage(page) => page.respond_to(req),
        }
    }
}

fn error_page(error: &'static str, description: &str) -> AuthorizeResponse {
    AuthorizeResponse::ErrorPage(HtmlErrorPage {
        status: rocket::http::Status::BadRequest,
        error,
        description: description.to_string(),
    })
}

// Past redirect-URI validation, errors travel as query parameters on the 302.
fn error_redirect(
    redirect_uri: &str,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> ApiResult<AuthorizeResponse> {
    let mut url = Url::parse(redirect_uri)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("error", error).append_pair("error_description", description);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(AuthorizeResponse::Redirect(Box::new(Redirect::found(url.to_string()))))
}

/// Rebuilds the `/authorize` URL for the post-login return trip.
fn original_url(q: &AuthorizeQuery) -> String {
    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    let params = [
        ("client_id", &q.client_id),
        ("redirect_uri", &q.redirect_uri),
        ("response_type", &q.response_type),
        ("scope", &q.scope),
        ("state", &q.state),
        ("nonce", &q.nonce),
        ("code_challenge", &q.code_challenge),
        ("code_challenge_method", &q.code_challenge_method),
    ];
    for (key, value) in params {
        if let Some(value) = value {
            qs.append_pair(key, value);
        }
    }
    format!("/authorize?{}", qs.finish())
}

#[get("/authorize?<q..>")]
async fn authorize(
    q: AuthorizeQuery,
    session: Option<Session>,
    info: RequestInfo,
    svc: &State<Services>,
) -> ApiResult<AuthorizeResponse> {
    info.enforce_https(&svc.config)?;

    // Steps 1 and 2 must never leak an unvalidated redirect URI, neither by
    // redirecting to it nor by echoing it into the page.
    let client = match &q.client_id {
        None => return Ok(error_page("invalid_client", "Missing client_id")),
        Some(raw) => match svc.clients.get(&ClientId::from(raw.clone())).await? {
            Some(client) => client,
            None => return Ok(error_page("invalid_client", "Unknown or inactive client")),
        },
    };

    let redirect_uri = match &q.redirect_uri {
        Some(uri) if client.is_redirect_uri_allowed(uri) => uri.clone(),
        _ => return Ok(error_page("invalid_request", "redirect_uri is missing or not registered")),
    };

    let state = q.state.as_deref();

    if q.response_type.as_deref() != Some("code") || !client.allows_response_type(ResponseType::Code) {
        return error_redirect(&redirect_uri, "unsupported_response_type", "Only response_type=code is supported", state);
    }

    let scopes: Vec<String> =
        q.scope.as_deref().unwrap_or_default().split_whitespace().map(str::to_string).collect();
    if !scopes.iter().any(|scope| scope == "openid") {
        return error_redirect(&redirect_uri, "invalid_scope", "The openid scope is required", state);
    }
    let (scopes_ok, invalid_scopes) = crate::clients::ClientRegistry::validate_scopes(&client, &scopes);
    if !scopes_ok {
        return error_redirect(
            &redirect_uri,
            "invalid_scope",
            &format!("Scopes not available to this client: {}", invalid_scopes.join(" ")),
            state,
        );
    }

    let code_challenge_method = match q.code_challenge_method.as_deref() {
        None => None,
        Some(raw) => match CodeChallengeMethod::from_param(raw) {
            Some(method) => Some(method),
            None => {
                return error_redirect(&redirect_uri, "invalid_request", "Unsupported code_challenge_method", state)
            }
        },
    };
    // Public clients get no other proof of possession; PKCE is mandatory
    if client.is_public() && q.code_challenge.is_none() {
        return error_redirect(&redirect_uri, "invalid_request", "code_challenge is required for public clients", state);
    }
    if q.code_challenge.is_none() && code_challenge_method.is_some() {
        return error_redirect(&redirect_uri, "invalid_request", "code_challenge_method without code_challenge", state);
    }
    let code_challenge_method = q.code_challenge.as_ref().map(|_| code_challenge_method.unwrap_or(CodeChallengeMethod::S256));

    let session = match session {
        Some(session) if q.prompt.as_deref() != Some("login") => session,
        _ => {
            let mut qs = url::form_urlencoded::Serializer::new(String::new());
            qs.append_pair("return_to", &original_url(&q));
            return Ok(AuthorizeResponse::Redirect(Box::new(Redirect::found(format!("/login?{}", qs.finish())))));
        }
    };

    if !client.allows_grant(GrantType::AuthorizationCode) {
        return error_redirect(&redirect_uri, "unauthorized_client", "Client may not use the authorization code grant", state);
    }

    let code = AuthorizationCode::new(
        client.uuid.clone(),
        redirect_uri.clone(),
        scopes,
        session.sub.clone(),
        q.code_challenge.clone(),
        code_challenge_method,
        q.nonce.clone(),
        session.auth_time,
        svc.config.auth_code_ttl(),
    );
    svc.repos.auth_codes.insert(&code).await?;

    let mut url = Url::parse(&redirect_uri)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code.code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(AuthorizeResponse::Redirect(Box::new(Redirect::found(url.to_string()))))
}

//
// Local login
//

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

#[get("/login?<return_to>&<error>")]
fn login_page(return_to: Option<String>, error: Option<String>) -> RawHtml<String> {
    let notice = if error.is_some() {
        "<p>Invalid email or password.</p>"
    } else {
        ""
    };
    let return_to = html_escape(return_to.as_deref().unwrap_or("/"));

    RawHtml(format!(
        "<!DOCTYPE html><html><head><title>Sign in</title></head><body>\
         <h1>Sign in</h1>{notice}\
         <form method=\"post\" action=\"/login\">\
         <input type=\"hidden\" name=\"return_to\" value=\"{return_to}\">\
         <label>Email <input type=\"email\" name=\"email\" autofocus></label>\
         <label>Password <input type=\"password\" name=\"password\"></label>\
         <button type=\"submit\">Sign in</button>\
         </form></body></html>"
    ))
}

#[derive(FromForm)]
struct LoginForm {
    email: String,
    password: String,
    return_to: Option<String>,
}

#[post("/login", data = "<form>")]
async fn login(
    form: Form<LoginForm>,
    info: RequestInfo,
    ip: ClientIp,
    jar: &CookieJar<'_>,
    svc: &State<Services>,
) -> ApiResult<Redirect> {
    info.enforce_https(&svc.config)?;
    let form = form.into_inner();
    let ip = ip.ip.map(|ip| ip.to_string());

    // The failure path is identical whether the account exists or the
    // password was wrong; no enumeration oracle.
    match svc.users.verify_password(&form.email, &form.password).await? {
        Some(account) => {
            security_event(
                "auth_success",
                &[("user_id", Some(&account.uuid.to_string())), ("ip", ip.as_deref())],
            );
            let token = svc.sessions.issue(&account.uuid)?;
            jar.add(svc.sessions.cookie(token, info.secure));
            Ok(Redirect::found(sanitize_return_to(form.return_to.as_deref())))
        }
        None => {
            security_event("auth_failure", &[("reason", Some("invalid_credentials")), ("ip", ip.as_deref())]);
            let mut qs = url::form_urlencoded::Serializer::new(String::new());
            qs.append_pair("error", "invalid_credentials");
            qs.append_pair("return_to", &sanitize_return_to(form.return_to.as_deref()));
            Ok(Redirect::found(format!("/login?{}", qs.finish())))
        }
    }
}
