//! Structured fuzz target for claim extraction and validation.
//!
//! Uses the `arbitrary` crate to generate plausible JWT payloads with
//! hostile values (mistyped claims, extreme timestamps, odd role lists),
//! assembles them into tokens, and runs them through decoding, claim
//! extraction, validation and role authorization.

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jwks_authn::{
    authorize, authorize_any,
    jwt::{TokenClaims, decode_jwt_payload, validate_claims},
};
use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value};

/// Structured input representing a fuzzed token payload.
#[derive(Debug, Arbitrary)]
struct FuzzedClaims {
    alg: String,
    kid: Option<String>,
    sub: Option<FuzzedValue>,
    iss: Option<FuzzedValue>,
    aud: Option<FuzzedValue>,
    exp: Option<FuzzedValue>,
    nbf: Option<FuzzedValue>,
    jti: Option<FuzzedValue>,
    roles: Option<FuzzedValue>,
    leeway_secs: u32,
    now: i64,
    required_role: String,
    signature_bytes: Vec<u8>,
}

/// JSON values covering the type confusions a hostile issuer could send.
#[derive(Debug, Arbitrary)]
enum FuzzedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    Mixed(Vec<Option<String>>),
}

impl FuzzedValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::StrList(list) => Value::Array(list.iter().cloned().map(Value::String).collect()),
            Self::Mixed(list) => Value::Array(
                list.iter()
                    .map(|item| item.clone().map_or(Value::from(0), Value::String))
                    .collect(),
            ),
        }
    }
}

fn build_token(input: &FuzzedClaims) -> String {
    let mut header = Map::new();
    header.insert("alg".to_owned(), Value::String(input.alg.clone()));
    if let Some(ref kid) = input.kid {
        header.insert("kid".to_owned(), Value::String(kid.clone()));
    }

    let mut payload = Map::new();
    for (name, value) in [
        ("sub", &input.sub),
        ("iss", &input.iss),
        ("aud", &input.aud),
        ("exp", &input.exp),
        ("nbf", &input.nbf),
        ("jti", &input.jti),
        ("roles", &input.roles),
    ] {
        if let Some(value) = value {
            payload.insert(name.to_owned(), value.to_json());
        }
    }

    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Value::Object(header)).unwrap_or_default());
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Value::Object(payload)).unwrap_or_default());
    let sig_b64 = URL_SAFE_NO_PAD.encode(&input.signature_bytes);

    format!("{header_b64}.{payload_b64}.{sig_b64}")
}

fuzz_target!(|input: FuzzedClaims| {
    let token = build_token(&input);

    let Ok(payload) = decode_jwt_payload(&token) else {
        return;
    };
    let Ok(claims) = TokenClaims::from_payload(payload, "roles") else {
        return;
    };

    let leeway = Duration::from_secs(u64::from(input.leeway_secs));
    let _ = validate_claims(&claims, "https://api.example.com", "https://idp.example.com/", leeway, input.now);
    if let Some(aud) = claims.aud.iter().next() {
        let _ = validate_claims(&claims, aud, &claims.iss, leeway, input.now);
    }

    let decision = authorize(&claims, &input.required_role);
    assert_eq!(decision.allow, claims.has_role(&input.required_role));
    let _ = authorize_any(&claims, &[input.required_role.as_str(), "admin"]);
});
