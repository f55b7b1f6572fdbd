mod account;
mod auth_code;
mod client;
mod oauth_state;
mod provider_account;
mod refresh_token;
mod signing_key;

pub use self::account::{Account, ContactType, UserContact, UserId};
pub use self::auth_code::{AuthorizationCode, CodeChallengeMethod};
pub use self::client::{Client, ClientId, GrantType, ResponseType, TokenEndpointAuthMethod};
pub use self::oauth_state::OAuthState;
pub use self::provider_account::ProviderAccount;
pub use self::refresh_token::RefreshTokenRecord;
pub use self::signing_key::SigningKeyRecord;
