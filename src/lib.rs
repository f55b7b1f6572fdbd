#[macro_use]
extern crate rocket;
#[macro_use]
extern crate log;

#[macro_use]
pub mod error;

pub mod api;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod db;
pub mod jose;
pub mod keys;
pub mod session;
pub mod sso;
pub mod sso_client;
pub mod tokens;
pub mod users;
pub mod util;

use std::sync::Arc;

use rocket::{Build, Rocket};

pub use crate::config::Config;
pub use crate::error::Error;

use crate::{
    clients::ClientRegistry, db::Repositories, keys::KeyManager, session::SessionIssuer, sso::Sso,
    tokens::TokenService, users::UserStore,
};

/// Every service the HTTP layer needs, composed once at startup and managed
/// as Rocket state. There are no process-wide singletons: tests build their
/// own bundle around fresh in-memory stores.
pub struct Services {
    pub config: Arc<Config>,
    pub repos: Repositories,
    pub users: Arc<dyn UserStore>,
    pub keys: Arc<KeyManager>,
    pub clients: Arc<ClientRegistry>,
    pub sessions: Arc<SessionIssuer>,
    pub tokens: Arc<TokenService>,
    pub sso: Arc<Sso>,
}

impl Services {
    pub async fn bootstrap(
        config: Config,
        repos: Repositories,
        users: Arc<dyn UserStore>,
    ) -> Result<Services, Error> {
        let config = Arc::new(config);

        let keys = Arc::new(KeyManager::load(repos.signing_keys.clone(), config.id_token_ttl()).await?);
        let clients = Arc::new(ClientRegistry::new(repos.clients.clone()));
        let sessions = Arc::new(SessionIssuer::new(&config));
        let tokens = Arc::new(TokenService::new(
            config.clone(),
            keys.clone(),
            repos.refresh_tokens.clone(),
            users.clone(),
        ));
        let sso = Arc::new(Sso::new(config.clone(), repos.clone(), users.clone())?);

        Ok(Services {
            config,
            repos,
            users,
            keys,
            clients,
            sessions,
            tokens,
            sso,
        })
    }
}

pub fn rocket(services: Services) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("port", services.config.port()))
        .merge(("address", "0.0.0.0"))
        .merge(("ident", "Keygate"));

    rocket::custom(figment).attach(util::AppHeaders()).manage(services).mount("/", api::routes())
}
