//! Complete sync responses.

use once_cell::sync::Lazy;
use ruma::RoomId;
use serde_json::{json, Value as JsonValue};

use super::sync_events::{ENCRYPTION, MEMBER, MEMBER_ADDITIONAL, NAME};
use crate::DEFAULT_TEST_ROOM_ID;

pub static DEFAULT_SYNC_ROOM_ID: Lazy<&RoomId> = Lazy::new(|| *DEFAULT_TEST_ROOM_ID);

pub static SYNC: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "device_one_time_keys_count": {},
        "next_batch": "s526_47314_0_7_1_1_1_11444_1",
        "device_lists": {
            "changed": [
                "@example:example.org"
            ],
            "left": []
        },
        "rooms": {
            "invite": {},
            "join": {
                *DEFAULT_SYNC_ROOM_ID: {
                    "state": {
                        "events": [
                            {
                                "content": {
                                    "join_rule": "public"
                                },
                                "event_id": "$15139375514WsgmR:localhost",
                                "origin_server_ts": 151393755000000_u64,
                                "sender": "@example:localhost",
                                "state_key": "",
                                "type": "m.room.join_rules",
                                "unsigned": {
                                    "age": 7034220
                                }
                            },
                            *MEMBER,
                            *NAME,
                        ]
                    },
                    "timeline": {
                        "events": [
                            {
                                "content": {
                                    "body": "baba",
                                    "format": "org.matrix.custom.html",
                                    "formatted_body": "<strong>baba</strong>",
                                    "msgtype": "m.text"
                                },
                                "event_id": "$152037280074GZeOm:localhost",
                                "origin_server_ts": 152037280,
                                "sender": "@example:localhost",
                                "type": "m.room.message",
                                "unsigned": {
                                    "age": 598971425
                                }
                            }
                        ],
                        "limited": true,
                        "prev_batch": "t392-516_47314_0_7_1_1_1_11444_1"
                    },
                }
            },
            "leave": {}
        },
    })
});

/// A sync response for a room that has encryption enabled and two members.
pub static ENCRYPTED_ROOM_SYNC: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "device_one_time_keys_count": {
            "signed_curve25519": 50
        },
        "next_batch": "s526_47314_0_7_1_1_1_11444_2",
        "device_lists": {
            "changed": [],
            "left": []
        },
        "rooms": {
            "join": {
                *DEFAULT_SYNC_ROOM_ID: {
                    "state": {
                        "events": [*MEMBER, *MEMBER_ADDITIONAL, *ENCRYPTION]
                    },
                    "timeline": {
                        "events": [],
                        "limited": false,
                        "prev_batch": "t392-516_47314_0_7_1_1_1_11444_2"
                    },
                }
            },
        },
    })
});

pub static LEAVE_SYNC: Lazy<JsonValue> = Lazy::new(|| {
    json!({
        "device_one_time_keys_count": {},
        "next_batch": "s526_47314_0_7_1_1_1_11444_3",
        "device_lists": {
            "changed": [],
            "left": []
        },
        "rooms": {
            "invite": {},
            "join": {},
            "leave": {
                *DEFAULT_SYNC_ROOM_ID: {
                    "state": {
                        "events": []
                    },
                    "timeline": {
                        "events": [
                            {
                                "content": {
                                    "membership": "leave"
                                },
                                "event_id": "$151800140479rdvjg:localhost",
                                "origin_server_ts": 151800140,
                                "sender": "@example:localhost",
                                "state_key": "@example:localhost",
                                "type": "m.room.member",
                                "unsigned": {
                                    "age": 1
                                }
                            },
                        ],
                        "limited": false,
                        "prev_batch": "t392-516_47314_0_7_1_1_1_11444_3"
                    }
                }
            }
        },
    })
});
