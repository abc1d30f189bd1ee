//! Responses to client API calls.

use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

/// `POST /_matrix/client/r0/keys/upload`
pub static KEYS_UPLOAD: Lazy<JsonValue> = Lazy::new(|| {
    json!({
      "one_time_key_counts": {
        "curve25519": 10,
        "signed_curve25519": 20
      }
    })
});

/// `POST /_matrix/client/r0/keys/query` for users without any devices.
pub static KEYS_QUERY_EMPTY: Lazy<JsonValue> = Lazy::new(|| {
    json!({
      "device_keys": {},
      "failures": {}
    })
});

/// `POST /_matrix/client/r0/keys/claim` when the server had no keys to hand
/// out.
pub static KEYS_CLAIM_EMPTY: Lazy<JsonValue> = Lazy::new(|| {
    json!({
      "one_time_keys": {},
      "failures": {}
    })
});

/// A 404 error body.
pub static NOT_FOUND: Lazy<JsonValue> = Lazy::new(|| {
    json!({
      "errcode": "M_NOT_FOUND",
      "error": "Event not found."
    })
});
