// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The body of a `GET /_matrix/client/r0/sync` response.

use std::collections::BTreeMap;

use ruma::{OneTimeKeyAlgorithm, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A `/sync` response as sent by the homeserver.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Response {
    /// The batch token to supply in the `since` param of the next `/sync`
    /// request.
    pub next_batch: String,

    /// Updates to rooms.
    #[serde(default)]
    pub rooms: Rooms,

    /// Information on E2E device updates.
    #[serde(default)]
    pub device_lists: DeviceLists,

    /// For each key algorithm, the number of unclaimed one-time keys
    /// currently held on the server for a device.
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<OneTimeKeyAlgorithm, u64>,
}

impl Response {
    /// Creates a new, empty `Response` with the given batch token.
    pub fn new(next_batch: String) -> Self {
        Self { next_batch, ..Default::default() }
    }
}

/// Updates to rooms.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Rooms {
    /// The rooms that the user has left or been banned from.
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,

    /// The rooms that the user has joined.
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,

    /// The rooms that the user has been invited to.
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
}

/// Updates to joined rooms.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JoinedRoom {
    /// Updates to the state, between the time indicated by the `since`
    /// parameter, and the start of the `timeline`.
    #[serde(default)]
    pub state: State,

    /// The timeline of messages and state changes in the room.
    #[serde(default)]
    pub timeline: Timeline,
}

/// Historical updates to left rooms.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LeftRoom {
    /// The state updates for the room up to the start of the timeline.
    #[serde(default)]
    pub state: State,

    /// The timeline of messages and state changes in the room up to the point
    /// when the user left.
    #[serde(default)]
    pub timeline: Timeline,
}

/// Updates to the rooms that the user has been invited to.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct InvitedRoom {
    /// The stripped state of the room.
    #[serde(default)]
    pub invite_state: State,
}

/// Events in the room.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Timeline {
    /// True if the number of events returned was limited by the `limit` on
    /// the filter.
    #[serde(default)]
    pub limited: bool,

    /// A token that can be supplied to to the `from` parameter of the
    /// `/rooms/{roomId}/messages` endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,

    /// A list of events, oldest first.
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

/// State events in the room.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct State {
    /// A list of state events, in server order.
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

/// Users whose device lists changed.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceLists {
    /// List of users who have updated their device identity keys or who now
    /// share an encrypted room with the client since the previous sync.
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,

    /// List of users who no longer share encrypted rooms since the previous
    /// sync response.
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

impl DeviceLists {
    /// Returns true if there are no device list updates.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use matrix_e2e_test::test_json;
    use ruma::OneTimeKeyAlgorithm;
    use serde_json::json;

    use super::Response;

    #[test]
    fn test_deserialize_full_sync() {
        let response: Response = serde_json::from_value(test_json::SYNC.clone()).unwrap();

        assert_eq!(response.next_batch, "s526_47314_0_7_1_1_1_11444_1");
        assert_eq!(response.device_lists.changed.len(), 1);

        let room = response.rooms.join.get(*test_json::DEFAULT_SYNC_ROOM_ID).unwrap();
        assert_eq!(room.state.events.len(), 3);
        assert!(room.timeline.limited);
        assert_eq!(room.timeline.prev_batch.as_deref(), Some("t392-516_47314_0_7_1_1_1_11444_1"));
    }

    #[test]
    fn test_missing_sections_default_to_empty() {
        let response: Response = serde_json::from_value(json!({
            "next_batch": "s1",
            "device_one_time_keys_count": { "signed_curve25519": 12 },
            "rooms": { "join": { "!room:localhost": {} } },
        }))
        .unwrap();

        assert!(response.device_lists.is_empty());
        assert_eq!(
            response.device_one_time_keys_count.get(&OneTimeKeyAlgorithm::SignedCurve25519),
            Some(&12)
        );

        let room = response.rooms.join.values().next().unwrap();
        assert!(room.timeline.events.is_empty());
        assert!(!room.timeline.limited);
    }
}
