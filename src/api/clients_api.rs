//
// Relying-party management API
//
use rocket::{http::Status, response::status, serde::json::Json, Route, State};
use serde_json::{json, Value};

use crate::{
    api::{ApiResult, JsonResult},
    clients::RegisterClientData,
    db::models::ClientId,
    Services,
};

pub fn routes() -> Vec<Route> {
    routes![register, list, get, update, deactivate]
}

#[post("/clients", data = "<data>")]
async fn register(data: Json<RegisterClientData>, svc: &State<Services>) -> ApiResult<status::Custom<Json<Value>>> {
    let registered = svc.clients.register(data.into_inner()).await?;

    let mut body = registered.client.to_json();
    if let Some(secret) = registered.client_secret {
        // One-time disclosure; only the hash survives
        body["clientSecret"] = json!(secret);
    }

    Ok(status::Custom(Status::Created, Json(body)))
}

#[get("/clients")]
async fn list(svc: &State<Services>) -> JsonResult {
    let clients: Vec<Value> = svc.clients.list().await?.iter().map(|client| client.to_json()).collect();
    Ok(Json(json!({ "clients": clients })))
}

#[get("/clients/<id>")]
async fn get(id: ClientId, svc: &State<Services>) -> JsonResult {
    match svc.clients.get(&id).await? {
        Some(client) => Ok(Json(client.to_json())),
        None => err_code!("invalid_request", "Client not found", 404),
    }
}

#[put("/clients/<id>", data = "<data>")]
async fn update(id: ClientId, data: Json<RegisterClientData>, svc: &State<Services>) -> JsonResult {
    let client = svc.clients.update(&id, data.into_inner()).await?;
    Ok(Json(client.to_json()))
}

#[delete("/clients/<id>")]
async fn deactivate(id: ClientId, svc: &State<Services>) -> JsonResult {
    svc.clients.deactivate(&id).await?;
    Ok(Json(json!({})))
}
