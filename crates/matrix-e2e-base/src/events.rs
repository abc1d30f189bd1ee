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

//! The subset of room events the base client interprets.
//!
//! Events travel through the client as raw JSON, the types in here are
//! deserialized on demand from the fields we care about.

use matrix_e2e_crypto::types::EventEncryptionAlgorithm;
use ruma::{OwnedEventId, OwnedUserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The event type of `m.room.encrypted` events.
pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
/// The event type of `m.room.encryption` state events.
pub const ROOM_ENCRYPTION: &str = "m.room.encryption";
/// The event type of `m.room.member` state events.
pub const ROOM_MEMBER: &str = "m.room.member";
/// The event type of `m.room.name` state events.
pub const ROOM_NAME: &str = "m.room.name";
/// The event type of `m.room.topic` state events.
pub const ROOM_TOPIC: &str = "m.room.topic";

/// A state event reduced to the fields needed to put it into the state map.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MinimalStateEvent {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The state key of the event.
    pub state_key: String,
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The event's content.
    #[serde(default)]
    pub content: JsonValue,
    /// The event's ID, stripped state events don't have one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
}

impl MinimalStateEvent {
    /// Extract the state event parts of a raw JSON event.
    ///
    /// Fails if the event has no `state_key`, it's not a state event then.
    pub fn from_json(event: &JsonValue) -> serde_json::Result<Self> {
        Self::deserialize(event)
    }

    /// Deserialize the content of the event.
    pub fn content_as<C: DeserializeOwned>(&self) -> serde_json::Result<C> {
        C::deserialize(&self.content)
    }

    /// The membership of an `m.room.member` event, `None` for every other
    /// event type or a malformed content.
    pub fn membership(&self) -> Option<MembershipState> {
        (self.event_type == ROOM_MEMBER)
            .then(|| self.content_as::<RoomMemberEventContent>().ok())
            .flatten()
            .map(|c| c.membership)
    }
}

/// The membership state of a user.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    /// The user is banned.
    Ban,
    /// The user has been invited.
    Invite,
    /// The user has joined.
    Join,
    /// The user has requested to join.
    Knock,
    /// The user has left.
    Leave,
    /// A membership we don't know about.
    #[serde(other)]
    Unknown,
}

impl MembershipState {
    /// Does this membership make the user a recipient of room messages.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Join | Self::Invite)
    }
}

/// The content of an `m.room.member` event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomMemberEventContent {
    /// The membership state of the user.
    pub membership: MembershipState,
    /// The display name of the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
}

/// The content of an `m.room.encryption` event.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoomEncryptionEventContent {
    /// The encryption algorithm to be used to encrypt messages sent in the
    /// room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long a session should be used before changing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages should be sent before changing the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

impl RoomEncryptionEventContent {
    /// Content enabling the pairwise Olm algorithm.
    pub fn olm() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            rotation_period_ms: None,
            rotation_period_msgs: None,
        }
    }
}

/// The content of an `m.room.name` event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomNameEventContent {
    /// The name of the room.
    #[serde(default)]
    pub name: Option<String>,
}

/// The content of an `m.room.topic` event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomTopicEventContent {
    /// The topic of the room.
    #[serde(default)]
    pub topic: Option<String>,
}
