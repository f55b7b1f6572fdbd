mod authorize;
mod clients_api;
mod end_session;
mod metadata;
mod sso_api;
mod token;

use std::net::IpAddr;

use rocket::{
    request::{FromRequest, Outcome, Request},
    serde::json::Json,
    Route,
};
use serde_json::Value;

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
pub type EmptyResult = ApiResult<()>;

pub fn routes() -> Vec<Route> {
    [
        metadata::routes(),
        authorize::routes(),
        token::routes(),
        clients_api::routes(),
        sso_api::routes(),
        end_session::routes(),
    ]
    .concat()
}

//
// Client IP address detection, for the security log
//
pub struct ClientIp {
    pub ip: Option<IpAddr>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse().ok())
            .or_else(|| req.client_ip());

        Outcome::Success(ClientIp {
            ip,
        })
    }
}
