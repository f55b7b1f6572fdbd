use chrono::{NaiveDateTime, Utc};

use crate::jose::Alg;

/// Persisted form of a signing key. Asymmetric keys carry PKCS#8 PEM private
/// material, HMAC keys a base64url secret; exactly one of the two is set.
#[derive(Clone, Debug)]
pub struct SigningKeyRecord {
    pub kid: String,
    pub alg: Alg,
    pub private_pem: Option<String>,
    pub secret_b64: Option<String>,
    pub created_at: NaiveDateTime,
    pub retired_at: Option<NaiveDateTime>,
}

impl SigningKeyRecord {
    pub fn new(kid: String, alg: Alg, private_pem: Option<String>, secret_b64: Option<String>) -> Self {
        Self {
            kid,
            alg,
            private_pem,
            secret_b64,
            created_at: Utc::now().naive_utc(),
            retired_at: None,
        }
    }
}
