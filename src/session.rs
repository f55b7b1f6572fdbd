//
// IdP session handling
//
use chrono::Utc;
use rocket::{
    http::{Cookie, SameSite, Status},
    request::{FromRequest, Outcome, Request},
};
use serde::{Deserialize, Serialize};

use crate::{
    api::ApiResult,
    config::Config,
    db::models::UserId,
    jose::{self, Alg, KeyMaterial},
};

pub const SESSION_COOKIE: &str = "keygate_session";

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionJwtClaims {
    // Subject
    pub sub: String,
    // Issued at; doubles as `auth_time` for codes minted under this session
    pub iat: i64,
    // Expiration time
    pub exp: i64,
}

/// Issues and checks the short-lived session JWTs carried by the HttpOnly
/// cookie. HS256 with the configured secret; the key registry is not involved
/// because these tokens never leave this process.
pub struct SessionIssuer {
    secret: KeyMaterial,
    ttl: i64,
}

impl SessionIssuer {
    pub fn new(config: &Config) -> Self {
        Self {
            secret: KeyMaterial::Secret(config.session_secret().to_vec()),
            ttl: config.session_ttl(),
        }
    }

    pub fn issue(&self, sub: &UserId) -> ApiResult<String> {
        let now = Utc::now().timestamp();
        let claims = SessionJwtClaims {
            sub: sub.to_string(),
            iat: now,
            exp: now + self.ttl,
        };

        jose::sign(&serde_json::to_value(&claims)?, &self.secret, Alg::HS256, None)
    }

    pub fn verify(&self, token: &str) -> ApiResult<SessionJwtClaims> {
        let jws = jose::verify(token, &self.secret, Alg::HS256)?;
        Ok(serde_json::from_value(jws.payload)?)
    }

    pub fn cookie(&self, token: String, secure: bool) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, token))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(rocket::time::Duration::seconds(self.ttl))
            .secure(secure)
            .build()
    }

    /// `Max-Age=0` clears the cookie on the client.
    pub fn removal_cookie(&self, secure: bool) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, ""))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(rocket::time::Duration::seconds(0))
            .secure(secure)
            .build()
    }
}

/// Open-redirect guard for the login flow: after backslash normalization the
/// target must be a local absolute path (`/...` but not `//...`); anything
/// else falls back to `/`.
pub fn sanitize_return_to(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "/".to_string();
    };
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') && !normalized.starts_with("//") {
        normalized
    } else {
        "/".to_string()
    }
}

//
// Request classification
//
pub struct RequestInfo {
    pub secure: bool,
    pub localhost: bool,
    pub host: String,
}

impl RequestInfo {
    /// Production refuses plaintext traffic that is not loopback.
    pub fn enforce_https(&self, config: &Config) -> ApiResult<()> {
        if config.production() && !self.secure && !self.localhost {
            err_code!("invalid_request", "HTTPS is required", 403);
        }
        Ok(())
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestInfo {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();

        // Secure iff the connection itself is TLS OR a proxy attests HTTPS;
        // a stray X-Forwarded-Proto header can never downgrade a TLS request.
        let secure = request.rocket().config().tls_enabled()
            || headers
                .get_one("X-Forwarded-Proto")
                .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

        let host = headers
            .get_one("X-Forwarded-Host")
            .or_else(|| headers.get_one("Host"))
            .unwrap_or_default()
            .to_string();

        // bracketed IPv6 literals keep their colons
        let hostname = match host.find(']') {
            Some(end) => &host[..=end],
            None => host.rsplit_once(':').map(|(name, _)| name).unwrap_or(&host),
        };
        let localhost = matches!(hostname, "localhost" | "127.0.0.1" | "[::1]");

        Outcome::Success(RequestInfo {
            secure,
            localhost,
            host,
        })
    }
}

/// An authenticated browser session, resolved from the session cookie.
pub struct Session {
    pub sub: UserId,
    pub auth_time: i64,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Session {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(services) = request.rocket().state::<crate::Services>() else {
            return Outcome::Error((Status::InternalServerError, "Services not managed"));
        };

        let Some(cookie) = request.cookies().get(SESSION_COOKIE) else {
            return Outcome::Error((Status::Unauthorized, "No session cookie"));
        };

        match services.sessions.verify(cookie.value()) {
            Ok(claims) => Outcome::Success(Session {
                sub: UserId::from(claims.sub),
                auth_time: claims.iat,
            }),
            Err(_) => Outcome::Error((Status::Unauthorized, "Invalid session")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> SessionIssuer {
        SessionIssuer::new(&Config::for_tests("https://id.example.com"))
    }

    #[test]
    fn session_roundtrip() {
        let issuer = issuer();
        let sub = UserId::random();
        let token = issuer.issue(&sub).unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, sub.to_string());
        assert_eq!(claims.exp, claims.iat + 900);
    }

    #[test]
    fn tampered_session_is_rejected() {
        let issuer = issuer();
        let token = issuer.issue(&UserId::random()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        assert!(issuer.verify(&tampered).is_err());
    }

    #[test]
    fn cookie_attributes() {
        let issuer = issuer();
        let cookie = issuer.cookie("token".to_string(), true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(rocket::time::Duration::seconds(900)));

        let insecure = issuer.cookie("token".to_string(), false);
        assert_eq!(insecure.secure(), Some(false));

        let removal = issuer.removal_cookie(false);
        assert_eq!(removal.max_age(), Some(rocket::time::Duration::seconds(0)));
    }

    #[test]
    fn return_to_sanitizer() {
        assert_eq!(sanitize_return_to(Some("/dashboard")), "/dashboard");
        assert_eq!(sanitize_return_to(Some("/a/b?c=d")), "/a/b?c=d");
        assert_eq!(sanitize_return_to(Some("https://evil.com/phishing")), "/");
        assert_eq!(sanitize_return_to(Some("//evil.com")), "/");
        // backslash smuggling collapses to a protocol-relative URL, rejected
        assert_eq!(sanitize_return_to(Some("/\\evil.com")), "/");
        assert_eq!(sanitize_return_to(Some("\\\\evil.com")), "/");
        assert_eq!(sanitize_return_to(Some("")), "/");
        assert_eq!(sanitize_return_to(None), "/");
    }
}
