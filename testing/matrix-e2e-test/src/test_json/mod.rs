//! Test data for the matrix-e2e crates.
//!
//! Exporting each static allows all the test data to have a single source of
//! truth.

use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

pub mod api_responses;
pub mod messages;
pub mod sync;
pub mod sync_events;

pub use api_responses::{KEYS_CLAIM_EMPTY, KEYS_QUERY_EMPTY, KEYS_UPLOAD, NOT_FOUND};
pub use messages::{ROOM_MESSAGES, ROOM_MESSAGES_END};
pub use sync::{DEFAULT_SYNC_ROOM_ID, ENCRYPTED_ROOM_SYNC, LEAVE_SYNC, SYNC};
pub use sync_events::{
    CREATE, ENCRYPTION, ENCRYPTION_CONTENT, ENCRYPTION_MEGOLM, MEMBER, MEMBER_ADDITIONAL,
    MEMBER_LEAVE, MEMBER_STRIPPED, NAME, NAME_STRIPPED, POWER_LEVELS, TOPIC,
};

/// An empty response.
pub static EMPTY: Lazy<JsonValue> = Lazy::new(|| json!({}));

/// A response with only an event ID.
pub static EVENT_ID: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "event_id": "$h29iv0s8:example.com"
    })
});
