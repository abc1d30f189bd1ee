use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value as JsonValue};

mod invited_room;
mod joined_room;
mod left_room;
mod test_event;

pub use invited_room::InvitedRoomBuilder;
pub use joined_room::JoinedRoomBuilder;
pub use left_room::LeftRoomBuilder;
pub use test_event::{StateTestEvent, StrippedStateTestEvent};

/// The `SyncResponseBuilder` struct can be used to easily generate valid sync
/// responses for testing.
///
/// It supports a number of canned events, such as a member entering a room or
/// the room name changing. It also supports insertion of custom events in the
/// form of JSON values.
#[derive(Default)]
pub struct SyncResponseBuilder {
    /// Updates to joined rooms.
    joined_rooms: BTreeMap<OwnedRoomId, JoinedRoom>,
    /// Updates to invited rooms.
    invited_rooms: BTreeMap<OwnedRoomId, InvitedRoom>,
    /// Updates to left rooms.
    left_rooms: BTreeMap<OwnedRoomId, LeftRoom>,
    /// Internal counter to enable the `next_batch` of each sync response to
    /// vary.
    batch_counter: i64,
    /// Users whose device lists changed.
    changed_device_lists: Vec<OwnedUserId>,
    /// Users we stopped sharing a room with.
    left_device_lists: Vec<OwnedUserId>,
    /// The number of unused one-time keys the server holds for us.
    one_time_key_count: Option<u64>,
}

impl SyncResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_joined_room(&mut self, room: JoinedRoomBuilder) -> &mut Self {
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.joined_rooms.insert(room.room_id, room.inner);
        self
    }

    /// Add an invited room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_invited_room(&mut self, room: InvitedRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.left_rooms.remove(&room.room_id);
        self.invited_rooms.insert(room.room_id, room.inner);
        self
    }

    /// Add a left room to the next sync response.
    ///
    /// If a room with the same room ID already exists, it is replaced by this
    /// one.
    pub fn add_left_room(&mut self, room: LeftRoomBuilder) -> &mut Self {
        self.joined_rooms.remove(&room.room_id);
        self.invited_rooms.remove(&room.room_id);
        self.left_rooms.insert(room.room_id, room.inner);
        self
    }

    /// Mark the device list of the given user as changed.
    pub fn add_change_device(&mut self, user_id: &UserId) -> &mut Self {
        self.changed_device_lists.push(user_id.to_owned());
        self
    }

    /// Report that we don't share any room with the given user anymore.
    pub fn add_left_device(&mut self, user_id: &UserId) -> &mut Self {
        self.left_device_lists.push(user_id.to_owned());
        self
    }

    /// Set the `signed_curve25519` one-time key count of the next response.
    pub fn set_one_time_key_count(&mut self, count: u64) -> &mut Self {
        self.one_time_key_count = Some(count);
        self
    }

    /// Builds a sync response as a JSON Value containing the events we queued
    /// so far.
    ///
    /// The next response returned by `build_json_sync_response` will then be
    /// empty if no further events were queued.
    pub fn build_json_sync_response(&mut self) -> JsonValue {
        self.batch_counter += 1;
        let next_batch = self.generate_sync_token();

        let one_time_key_counts = match self.one_time_key_count {
            Some(count) => json!({ "signed_curve25519": count }),
            None => json!({}),
        };

        let body = json! {
            {
                "device_one_time_keys_count": one_time_key_counts,
                "next_batch": next_batch,
                "device_lists": {
                    "changed": self.changed_device_lists,
                    "left": self.left_device_lists,
                },
                "rooms": {
                    "invite": self.invited_rooms,
                    "join": self.joined_rooms,
                    "leave": self.left_rooms,
                },
            }
        };

        // Clear state so that the next sync response will be empty if nothing
        // was added.
        self.clear();

        body
    }

    /// Builds a typed sync response containing the events we queued so far.
    ///
    /// The target type is whatever the crate under test deserializes a
    /// `/sync` body into.
    pub fn build_sync_response<T: DeserializeOwned>(&mut self) -> T {
        serde_json::from_value(self.build_json_sync_response())
            .expect("the builder should always produce a valid sync response")
    }

    /// The `next_batch` token of the last built response.
    pub fn last_sync_token(&self) -> String {
        self.generate_sync_token()
    }

    fn generate_sync_token(&self) -> String {
        format!("t392-516_47314_0_7_1_1_1_11444_{}", self.batch_counter)
    }

    pub fn clear(&mut self) {
        self.invited_rooms.clear();
        self.joined_rooms.clear();
        self.left_rooms.clear();
        self.changed_device_lists.clear();
        self.left_device_lists.clear();
        self.one_time_key_count = None;
    }
}

#[derive(Default, Serialize)]
struct Timeline {
    events: Vec<JsonValue>,
    limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_batch: Option<String>,
}

#[derive(Default, Serialize)]
struct State {
    events: Vec<JsonValue>,
}

#[derive(Default, Serialize)]
struct JoinedRoom {
    state: State,
    timeline: Timeline,
}

#[derive(Default, Serialize)]
struct InvitedRoom {
    invite_state: State,
}

#[derive(Default, Serialize)]
struct LeftRoom {
    state: State,
    timeline: Timeline,
}
