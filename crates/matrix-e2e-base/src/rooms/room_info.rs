// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{
    MembershipState, MinimalStateEvent, RoomEncryptionEventContent, RoomNameEventContent,
    RoomTopicEventContent, ROOM_ENCRYPTION, ROOM_MEMBER, ROOM_NAME, ROOM_TOPIC,
};

/// Enum keeping track in which state the room is, e.g. if our own user is
/// joined, invited, or has left the room.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RoomType {
    /// The room is in a joined state.
    Joined,
    /// The room is in a left state.
    Left,
    /// The room is in a invited state.
    Invited,
}

/// The underlying pure data structure for joined and left rooms.
///
/// Holds all the info needed to persist a room into the state store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomInfo {
    /// The unique room id of the room.
    pub(crate) room_id: OwnedRoomId,
    /// The type of the room.
    pub(crate) room_type: RoomType,
    /// The prev batch of the oldest event we hold locally.
    #[serde(default)]
    pub(crate) prev_batch: Option<String>,
    /// The `m.room.name` of this room.
    #[serde(default)]
    pub(crate) name: Option<String>,
    /// The topic of this room.
    #[serde(default)]
    pub(crate) topic: Option<String>,
    /// The `m.room.encryption` event content that enabled E2EE in this room.
    #[serde(default)]
    pub(crate) encryption: Option<RoomEncryptionEventContent>,
    /// The latest membership of every user we've seen a member event for.
    #[serde(default)]
    pub(crate) members: BTreeMap<OwnedUserId, MembershipState>,
}

impl RoomInfo {
    /// Create a new, empty info for the given room.
    pub fn new(room_id: &RoomId, room_type: RoomType) -> Self {
        Self {
            room_id: room_id.to_owned(),
            room_type,
            prev_batch: None,
            name: None,
            topic: None,
            encryption: None,
            members: BTreeMap::new(),
        }
    }

    /// The room id of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The type of the room.
    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    /// The name of the room, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The pagination token of the oldest event we hold locally.
    pub fn prev_batch(&self) -> Option<&str> {
        self.prev_batch.as_deref()
    }

    /// The encryption configuration of the room, if the room is encrypted.
    pub fn encryption(&self) -> Option<&RoomEncryptionEventContent> {
        self.encryption.as_ref()
    }

    pub(crate) fn mark_as_joined(&mut self) {
        self.room_type = RoomType::Joined;
    }

    pub(crate) fn mark_as_left(&mut self) {
        self.room_type = RoomType::Left;
    }

    pub(crate) fn mark_as_invited(&mut self) {
        self.room_type = RoomType::Invited;
    }

    pub(crate) fn set_prev_batch(&mut self, prev_batch: Option<&str>) -> bool {
        if self.prev_batch.as_deref() != prev_batch {
            self.prev_batch = prev_batch.map(ToOwned::to_owned);
            true
        } else {
            false
        }
    }

    /// Is this room encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// The users that are joined or invited to the room.
    pub fn active_members(&self) -> impl Iterator<Item = &UserId> {
        self.members.iter().filter(|(_, m)| m.is_active()).map(|(u, _)| u.as_ref())
    }

    /// Handle a state event for this room and update our info accordingly.
    ///
    /// Returns true if the event modified the info, false otherwise.
    pub fn handle_state_event(&mut self, event: &MinimalStateEvent) -> bool {
        match event.event_type.as_str() {
            ROOM_ENCRYPTION => match event.content_as::<RoomEncryptionEventContent>() {
                Ok(content) => self.handle_encryption_content(content),
                Err(e) => {
                    warn!(
                        room_id = ?self.room_id,
                        "Couldn't deserialize the encryption content: {e}"
                    );
                    false
                }
            },
            ROOM_NAME => {
                let name = event.content_as::<RoomNameEventContent>().ok().and_then(|c| c.name);
                self.name = name;
                true
            }
            ROOM_TOPIC => {
                let topic = event.content_as::<RoomTopicEventContent>().ok().and_then(|c| c.topic);
                self.topic = topic;
                true
            }
            ROOM_MEMBER => {
                let (Some(membership), Ok(user_id)) =
                    (event.membership(), UserId::parse(event.state_key.as_str()))
                else {
                    warn!(
                        room_id = ?self.room_id,
                        state_key = event.state_key,
                        "Invalid member event"
                    );
                    return false;
                };

                self.members.insert(user_id, membership);
                true
            }
            _ => false,
        }
    }

    /// Set the encryption configuration of the room.
    ///
    /// The configuration is only ever set once, a conflicting later one is
    /// logged and ignored.
    pub(crate) fn handle_encryption_content(
        &mut self,
        content: RoomEncryptionEventContent,
    ) -> bool {
        match &self.encryption {
            None => {
                debug!(
                    room_id = ?self.room_id,
                    algorithm = %content.algorithm,
                    "Room got encrypted"
                );
                self.encryption = Some(content);
                true
            }
            Some(old) if old.algorithm == content.algorithm => false,
            Some(old) => {
                warn!(
                    room_id = ?self.room_id,
                    old_algorithm = %old.algorithm,
                    new_algorithm = %content.algorithm,
                    "Ignoring a conflicting room encryption configuration",
                );
                false
            }
        }
    }
}
