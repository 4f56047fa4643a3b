//! Fuzz target for bearer extraction and JWT parsing.
//!
//! Feeds arbitrary byte strings as `Authorization` header values and as raw
//! tokens. Every result must be either `Ok(...)` or `Err(AuthError)`; any
//! panic is a bug.

#![no_main]

use std::time::Duration;

use jsonwebtoken::Algorithm;
use libfuzzer_sys::fuzz_target;

use jwks_authn::{
    gate::extract_bearer,
    jwt::{TokenClaims, decode_jwt_header, decode_jwt_payload, validate_payload},
    validation::{validate_algorithm, validate_kid},
};

fuzz_target!(|data: &[u8]| {
    // Header values and tokens are always UTF-8 by the time they reach us
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Treat the input as a whole header value
    if let Ok(token) = extract_bearer(input) {
        let _ = decode_jwt_header(token);
    }

    // And as a bare token
    if let Ok(header) = decode_jwt_header(input) {
        let _ = validate_algorithm(&header.alg, Algorithm::RS256);
        if let Some(ref kid) = header.kid {
            let _ = validate_kid(kid);
        }
    }

    if let Ok(payload) = decode_jwt_payload(input) {
        let _ = validate_payload(&payload, "https://api.example.com", "https://idp.example.com/", Duration::ZERO, 0);
        let _ = TokenClaims::from_payload(payload, "roles");
    }
});
