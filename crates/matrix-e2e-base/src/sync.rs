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

//! The SDK's representation of the result of a `/sync` request.

use std::collections::BTreeMap;

use matrix_e2e_common::deserialized_responses::SyncTimelineEvent;
use ruma::{OneTimeKeyAlgorithm, OwnedRoomId};
use serde_json::Value as JsonValue;

pub use crate::api::sync_events::DeviceLists;

/// Internal representation of a `/sync` response.
///
/// Timelines only contain the events we didn't know about yet, encrypted
/// events are already decrypted or replaced with an `m.bad.encrypted`
/// message.
#[derive(Clone, Debug, Default)]
pub struct SyncResponse {
    /// The batch token to supply in the `since` param of the next `/sync`
    /// request.
    pub next_batch: String,
    /// Updates to rooms.
    pub rooms: Rooms,
    /// Information on E2E device updates.
    pub device_lists: DeviceLists,
    /// For each key algorithm, the number of unclaimed one-time keys
    /// currently held on the server for this device.
    pub device_one_time_keys_count: BTreeMap<OneTimeKeyAlgorithm, u64>,
}

impl SyncResponse {
    pub(crate) fn new(next_batch: String) -> Self {
        Self { next_batch, ..Default::default() }
    }
}

/// Updates to rooms in a [`SyncResponse`].
#[derive(Clone, Debug, Default)]
pub struct Rooms {
    /// The rooms that the user has left or been banned from.
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
    /// The rooms that the user has joined.
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    /// The rooms that the user has been invited to.
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
}

/// Updates to joined rooms.
#[derive(Clone, Debug, Default)]
pub struct JoinedRoom {
    /// The timeline of messages and state changes in the room.
    pub timeline: Timeline,
    /// Updates to the state, between the time indicated by the `since`
    /// parameter, and the start of the `timeline`.
    pub state: Vec<JsonValue>,
}

/// Updates to left rooms.
#[derive(Clone, Debug, Default)]
pub struct LeftRoom {
    /// The timeline of messages and state changes in the room up to the point
    /// when the user left.
    pub timeline: Timeline,
    /// Updates to the state up to the start of the `timeline`.
    pub state: Vec<JsonValue>,
}

/// Updates to invited rooms.
#[derive(Clone, Debug, Default)]
pub struct InvitedRoom {
    /// The stripped state of the room.
    pub invite_state: Vec<JsonValue>,
}

/// Events in the room.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    /// True if the number of events returned was limited by the `limit` on the
    /// filter.
    pub limited: bool,

    /// A token that can be supplied to to the `from` parameter of the
    /// `/rooms/{roomId}/messages` endpoint.
    pub prev_batch: Option<String>,

    /// A list of events.
    pub events: Vec<SyncTimelineEvent>,
}

impl Timeline {
    pub(crate) fn new(limited: bool, prev_batch: Option<String>) -> Self {
        Self { limited, prev_batch, ..Default::default() }
    }
}
