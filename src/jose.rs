//
// JOSE: compact JWS signing and verification
//
// Every JWT this server mints or checks goes through here: its own access,
// ID and session tokens as well as the ID tokens of federated providers.
// ECDSA signatures are exchanged in IEEE P1363 form (fixed-width R||S), not
// DER, per RFC 7518 §3.4.
use chrono::Utc;
use data_encoding::BASE64URL_NOPAD;
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    nid::Nid,
    pkey::{HasPublic, PKey, PKeyRef, Private, Public},
    sign::{Signer, Verifier},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{api::ApiResult, crypto};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Alg {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    HS256,
    HS384,
    HS512,
}

impl Alg {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RS256" => Some(Alg::RS256),
            "RS384" => Some(Alg::RS384),
            "RS512" => Some(Alg::RS512),
            "ES256" => Some(Alg::ES256),
            "ES384" => Some(Alg::ES384),
            "ES512" => Some(Alg::ES512),
            "HS256" => Some(Alg::HS256),
            "HS384" => Some(Alg::HS384),
            "HS512" => Some(Alg::HS512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Alg::RS256 => "RS256",
            Alg::RS384 => "RS384",
            Alg::RS512 => "RS512",
            Alg::ES256 => "ES256",
            Alg::ES384 => "ES384",
            Alg::ES512 => "ES512",
            Alg::HS256 => "HS256",
            Alg::HS384 => "HS384",
            Alg::HS512 => "HS512",
        }
    }

    pub fn kty(&self) -> &'static str {
        match self {
            Alg::RS256 | Alg::RS384 | Alg::RS512 => "RSA",
            Alg::ES256 | Alg::ES384 | Alg::ES512 => "EC",
            Alg::HS256 | Alg::HS384 | Alg::HS512 => "oct",
        }
    }

    pub fn is_hmac(&self) -> bool {
        matches!(self, Alg::HS256 | Alg::HS384 | Alg::HS512)
    }

    fn digest(&self) -> MessageDigest {
        match self {
            Alg::RS256 | Alg::ES256 | Alg::HS256 => MessageDigest::sha256(),
            Alg::RS384 | Alg::ES384 | Alg::HS384 => MessageDigest::sha384(),
            Alg::RS512 | Alg::ES512 | Alg::HS512 => MessageDigest::sha512(),
        }
    }

    pub fn curve_nid(&self) -> Option<Nid> {
        match self {
            Alg::ES256 => Some(Nid::X9_62_PRIME256V1),
            Alg::ES384 => Some(Nid::SECP384R1),
            Alg::ES512 => Some(Nid::SECP521R1),
            _ => None,
        }
    }

    pub fn crv(&self) -> Option<&'static str> {
        match self {
            Alg::ES256 => Some("P-256"),
            Alg::ES384 => Some("P-384"),
            Alg::ES512 => Some("P-521"),
            _ => None,
        }
    }

    /// Byte width of one ECDSA coordinate: ceil(curve_bits / 8)
    pub fn coordinate_len(&self) -> Option<usize> {
        match self {
            Alg::ES256 => Some(32),
            Alg::ES384 => Some(48),
            Alg::ES512 => Some(66),
            _ => None,
        }
    }
}

impl std::fmt::Display for Alg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key material a JWS operation can run against. Signing needs `Private` or
/// `Secret`; verification additionally accepts `Public` (provider JWKS keys).
#[derive(Clone)]
pub enum KeyMaterial {
    Private(PKey<Private>),
    Public(PKey<Public>),
    Secret(Vec<u8>),
}

#[derive(Debug)]
pub struct Jws {
    pub header: Value,
    pub payload: Value,
}

pub fn b64url_encode(bytes: &[u8]) -> String {
    BASE64URL_NOPAD.encode(bytes)
}

pub fn b64url_decode(input: &str) -> ApiResult<Vec<u8>> {
    match BASE64URL_NOPAD.decode(input.as_bytes()) {
        Ok(bytes) => Ok(bytes),
        Err(_) => err!("invalid_token", "Invalid JWT format"),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn decode_json_object(raw: &str, part: &str) -> ApiResult<Value> {
    let bytes = b64url_decode(raw)?;
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(_) => err!("invalid_token", "Invalid JWT format"),
    };
    if !value.is_object() {
        err!(
            "invalid_token",
            format!("Invalid JWT format: {part} must be a JSON object, got {}", json_kind(&value))
        );
    }
    Ok(value)
}

/// Decodes the protected header without verifying anything. Only for picking
/// the verification key (`kid`/`alg`); never trust other header content.
pub fn decode_header(token: &str) -> ApiResult<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        err!("invalid_token", "Invalid JWT format");
    }
    decode_json_object(parts[0], "header")
}

pub fn sign(payload: &Value, key: &KeyMaterial, alg: Alg, kid: Option<&str>) -> ApiResult<String> {
    let mut header = Map::new();
    header.insert("alg".into(), json!(alg.as_str()));
    header.insert("typ".into(), json!("JWT"));
    if let Some(kid) = kid {
        header.insert("kid".into(), json!(kid));
    }

    let signing_input = format!(
        "{}.{}",
        b64url_encode(&serde_json::to_vec(&header)?),
        b64url_encode(&serde_json::to_vec(payload)?)
    );

    let signature = match (alg.is_hmac(), key) {
        (true, KeyMaterial::Secret(secret)) => hmac_sign(secret, alg, signing_input.as_bytes())?,
        (false, KeyMaterial::Private(pkey)) => {
            let mut signer = Signer::new(alg.digest(), pkey)?;
            signer.update(signing_input.as_bytes())?;
            let raw = signer.sign_to_vec()?;
            if let Some(coord_len) = alg.coordinate_len() {
                ecdsa_der_to_p1363(&raw, coord_len)?
            } else {
                raw
            }
        }
        _ => err!("server_error", format!("Signing key does not match algorithm {alg}")),
    };

    Ok(format!("{signing_input}.{}", b64url_encode(&signature)))
}

/// Verifies a compact JWS. `expected_alg` is mandatory: the header `alg` must
/// equal it exactly, which closes the algorithm-confusion hole (`none`, or an
/// HS* signature checked against an RSA public key).
pub fn verify(token: &str, key: &KeyMaterial, expected_alg: Alg) -> ApiResult<Jws> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        err!("invalid_token", "Invalid JWT format");
    }

    let header = decode_json_object(parts[0], "header")?;
    if header.get("alg").and_then(Value::as_str) != Some(expected_alg.as_str()) {
        err!("invalid_token", "JWT algorithm mismatch");
    }

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let signature = match b64url_decode(parts[2]) {
        Ok(bytes) => bytes,
        Err(_) => err!("invalid_token", "Invalid JWT signature"),
    };

    let valid = match (expected_alg.is_hmac(), key) {
        (true, KeyMaterial::Secret(secret)) => {
            let expected = hmac_sign(secret, expected_alg, signing_input.as_bytes())?;
            crypto::ct_eq(&expected, &signature)
        }
        (false, KeyMaterial::Private(pkey)) => {
            verify_signature(pkey, expected_alg, signing_input.as_bytes(), &signature)?
        }
        (false, KeyMaterial::Public(pkey)) => {
            verify_signature(pkey, expected_alg, signing_input.as_bytes(), &signature)?
        }
        _ => err!("invalid_token", "JWT algorithm mismatch"),
    };
    if !valid {
        err!("invalid_token", "Invalid JWT signature");
    }

    let payload = decode_json_object(parts[1], "payload")?;
    let now = Utc::now().timestamp();

    if let Some(value) = payload.get("exp") {
        if numeric_claim(value, "exp")? <= now {
            err!("invalid_token", "JWT has expired");
        }
    }
    if let Some(value) = payload.get("nbf") {
        if numeric_claim(value, "nbf")? > now {
            err!("invalid_token", "JWT is not yet valid (nbf claim)");
        }
    }

    Ok(Jws {
        header,
        payload,
    })
}

// RFC 7519 NumericDate must be a JSON number. Strings and booleans that other
// stacks coerce are rejected outright.
fn numeric_claim(value: &Value, claim: &str) -> ApiResult<i64> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) => Ok(v),
            None => Ok(n.as_f64().unwrap_or_default() as i64),
        },
        _ => err!("invalid_token", format!("{claim} claim must be a number")),
    }
}

fn hmac_sign(secret: &[u8], alg: Alg, data: &[u8]) -> ApiResult<Vec<u8>> {
    let key = PKey::hmac(secret)?;
    let mut signer = Signer::new(alg.digest(), &key)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

fn verify_signature<T: HasPublic>(
    pkey: &PKeyRef<T>,
    alg: Alg,
    data: &[u8],
    signature: &[u8],
) -> ApiResult<bool> {
    let der;
    let signature = if let Some(coord_len) = alg.coordinate_len() {
        if signature.len() != coord_len * 2 {
            return Ok(false);
        }
        der = ecdsa_p1363_to_der(signature, coord_len)?;
        der.as_slice()
    } else {
        signature
    };

    let mut verifier = Verifier::new(alg.digest(), pkey)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature).unwrap_or(false))
}

fn ecdsa_der_to_p1363(der: &[u8], coord_len: usize) -> ApiResult<Vec<u8>> {
    let sig = EcdsaSig::from_der(der)?;
    let mut out = Vec::with_capacity(coord_len * 2);
    out.extend_from_slice(&sig.r().to_vec_padded(coord_len as i32)?);
    out.extend_from_slice(&sig.s().to_vec_padded(coord_len as i32)?);
    Ok(out)
}

fn ecdsa_p1363_to_der(signature: &[u8], coord_len: usize) -> ApiResult<Vec<u8>> {
    let r = BigNum::from_slice(&signature[..coord_len])?;
    let s = BigNum::from_slice(&signature[coord_len..])?;
    Ok(EcdsaSig::from_private_components(r, s)?.to_der()?)
}

/// Fills `iat` and `exp` when the caller did not provide them and leaves every
/// other claim untouched.
pub fn build_payload(mut claims: Map<String, Value>, default_ttl: i64) -> Value {
    let now = Utc::now().timestamp();
    claims.entry("iat").or_insert_with(|| json!(now));
    claims.entry("exp").or_insert_with(|| json!(now + default_ttl));
    Value::Object(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{ec::EcGroup, ec::EcKey, rsa::Rsa};

    const ALL_ALGS: [Alg; 9] = [
        Alg::RS256,
        Alg::RS384,
        Alg::RS512,
        Alg::ES256,
        Alg::ES384,
        Alg::ES512,
        Alg::HS256,
        Alg::HS384,
        Alg::HS512,
    ];

    fn test_key(alg: Alg) -> KeyMaterial {
        match alg.kty() {
            "RSA" => KeyMaterial::Private(PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()),
            "EC" => {
                let group = EcGroup::from_curve_name(alg.curve_nid().unwrap()).unwrap();
                KeyMaterial::Private(PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap())
            }
            _ => KeyMaterial::Secret(crypto::get_random_bytes::<64>().to_vec()),
        }
    }

    fn payload() -> Value {
        let now = Utc::now().timestamp();
        json!({"sub": "user-1", "iss": "https://id.example.com", "exp": now + 60, "iat": now})
    }

    #[test]
    fn sign_verify_roundtrip_all_algorithms() {
        for alg in ALL_ALGS {
            let key = test_key(alg);
            let token = sign(&payload(), &key, alg, Some("kid-1")).unwrap();
            let jws = verify(&token, &key, alg).unwrap();
            assert_eq!(jws.payload, payload(), "{alg}");
            assert_eq!(jws.header["kid"], json!("kid-1"));
            assert_eq!(jws.header["typ"], json!("JWT"));
        }
    }

    #[test]
    fn verify_rejects_algorithm_mismatch() {
        for alg in ALL_ALGS {
            let key = test_key(alg);
            let token = sign(&payload(), &key, alg, None).unwrap();
            for other in ALL_ALGS {
                if other == alg {
                    continue;
                }
                let err = verify(&token, &key, other).unwrap_err();
                assert_eq!(err.message(), "JWT algorithm mismatch", "{alg} vs {other}");
            }
        }
    }

    #[test]
    fn verify_rejects_wrong_key() {
        for alg in ALL_ALGS {
            let token = sign(&payload(), &test_key(alg), alg, None).unwrap();
            let err = verify(&token, &test_key(alg), alg).unwrap_err();
            assert_eq!(err.message(), "Invalid JWT signature", "{alg}");
        }
    }

    #[test]
    fn base64url_roundtrip() {
        for len in [0usize, 1, 2, 3, 31, 32, 33, 255] {
            let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(b64url_decode(&b64url_encode(&bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn ecdsa_signatures_are_fixed_width_p1363() {
        for (alg, expected) in [(Alg::ES256, 64), (Alg::ES384, 96), (Alg::ES512, 132)] {
            let token = sign(&payload(), &test_key(alg), alg, None).unwrap();
            let sig = b64url_decode(token.rsplit('.').next().unwrap()).unwrap();
            assert_eq!(sig.len(), expected, "{alg}");
        }
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = test_key(Alg::HS256);
        let now = Utc::now().timestamp();
        let token = sign(&json!({"sub": "x", "exp": now - 1}), &key, Alg::HS256, None).unwrap();
        assert_eq!(verify(&token, &key, Alg::HS256).unwrap_err().message(), "JWT has expired");
    }

    #[test]
    fn premature_token_is_rejected() {
        let key = test_key(Alg::HS256);
        let now = Utc::now().timestamp();
        let token = sign(&json!({"sub": "x", "nbf": now + 120}), &key, Alg::HS256, None).unwrap();
        assert_eq!(
            verify(&token, &key, Alg::HS256).unwrap_err().message(),
            "JWT is not yet valid (nbf claim)"
        );
    }

    #[test]
    fn non_numeric_time_claims_are_rejected() {
        let key = test_key(Alg::HS256);
        let token = sign(&json!({"sub": "x", "exp": "4102444800"}), &key, Alg::HS256, None).unwrap();
        assert_eq!(verify(&token, &key, Alg::HS256).unwrap_err().message(), "exp claim must be a number");

        let token = sign(&json!({"sub": "x", "nbf": true}), &key, Alg::HS256, None).unwrap();
        assert_eq!(verify(&token, &key, Alg::HS256).unwrap_err().message(), "nbf claim must be a number");
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let key = KeyMaterial::Secret(b"secret".to_vec());
        let header = b64url_encode(&serde_json::to_vec(&json!({"alg": "HS256", "typ": "JWT"})).unwrap());
        let body = b64url_encode(b"[1,2,3]");
        let input = format!("{header}.{body}");
        let sig = b64url_encode(&hmac_sign(b"secret", Alg::HS256, input.as_bytes()).unwrap());
        let err = verify(&format!("{input}.{sig}"), &key, Alg::HS256).unwrap_err();
        assert_eq!(err.message(), "Invalid JWT format: payload must be a JSON object, got array");
    }

    #[test]
    fn build_payload_fills_defaults_and_keeps_extras() {
        let mut claims = Map::new();
        claims.insert("sub".into(), json!("user-1"));
        claims.insert("favorite_color".into(), json!("teal"));
        let built = build_payload(claims, 900);
        assert_eq!(built["sub"], json!("user-1"));
        assert_eq!(built["favorite_color"], json!("teal"));
        let iat = built["iat"].as_i64().unwrap();
        assert_eq!(built["exp"].as_i64().unwrap(), iat + 900);

        let mut claims = Map::new();
        claims.insert("exp".into(), json!(12345));
        assert_eq!(build_payload(claims, 900)["exp"], json!(12345));
    }
}
