//! Example responses from calls to `GET
//! /_matrix/client/r0/rooms/{roomId}/messages`.

use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};

pub static ROOM_MESSAGES: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "chunk": [
          {
            "content": {
              "body": "the world is big",
              "msgtype": "m.text"
            },
            "event_id": "$1444812213350496Cbbbf:example.com",
            "origin_server_ts": 1444812194656i64,
            "room_id": "!SVkFJHzfwvuaIEawgC:localhost",
            "sender": "@bob:example.com",
            "type": "m.room.message"
          },
          {
            "content": {
              "body": "hello world",
              "msgtype": "m.text"
            },
            "event_id": "$1444812213350496Caaaf:example.com",
            "origin_server_ts": 1444812163990i64,
            "room_id": "!SVkFJHzfwvuaIEawgC:localhost",
            "sender": "@alice:example.com",
            "type": "m.room.message"
          }
        ],
        "end": "t47409-4357353_219380_26003_2265",
        "start": "t392-516_47314_0_7_1_1_1_11444_1"
    })
});

/// A `/messages` response without an `end` token, the start of the room was
/// reached.
pub static ROOM_MESSAGES_END: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "chunk": [
          {
            "content": {
              "creator": "@example:localhost",
              "room_version": "1"
            },
            "event_id": "$151957878228ekrDs:localhost",
            "origin_server_ts": 15195787,
            "sender": "@example:localhost",
            "state_key": "",
            "type": "m.room.create"
          }
        ],
        "start": "t47409-4357353_219380_26003_2265"
    })
});
