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

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use matrix_e2e_common::{deserialized_responses::SyncTimelineEvent, locks::RwLock as SyncRwLock};
use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value as JsonValue;

use super::{RoomInfo, RoomType};
use crate::{
    events::{MembershipState, RoomEncryptionEventContent, ROOM_MEMBER},
    store::{DynStateStore, Result as StoreResult},
};

/// The timeline of a room as far as we've seen it, oldest event first.
#[derive(Debug, Default)]
struct RoomTimeline {
    events: VecDeque<SyncTimelineEvent>,
    event_ids: HashSet<OwnedEventId>,
}

impl RoomTimeline {
    fn contains(&self, event: &SyncTimelineEvent) -> bool {
        event.event_id().is_some_and(|id| self.event_ids.contains(&id))
    }

    fn remember(&mut self, event: &SyncTimelineEvent) {
        if let Some(event_id) = event.event_id() {
            self.event_ids.insert(event_id);
        }
    }
}

/// The underlying room data structure collecting state for joined, left and
/// invited rooms.
#[derive(Debug, Clone)]
pub struct Room {
    room_id: OwnedRoomId,
    own_user_id: OwnedUserId,
    inner: Arc<SyncRwLock<RoomInfo>>,
    timeline: Arc<SyncRwLock<RoomTimeline>>,
    store: Arc<DynStateStore>,
}

impl Room {
    pub(crate) fn new(
        own_user_id: &UserId,
        store: Arc<DynStateStore>,
        room_id: &RoomId,
        room_type: RoomType,
    ) -> Self {
        let room_info = RoomInfo::new(room_id, room_type);
        Self::restore(own_user_id, store, room_info)
    }

    pub(crate) fn restore(
        own_user_id: &UserId,
        store: Arc<DynStateStore>,
        room_info: RoomInfo,
    ) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            room_id: room_info.room_id.clone(),
            store,
            inner: Arc::new(SyncRwLock::new(room_info)),
            timeline: Default::default(),
        }
    }

    /// Get the unique room id of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Get our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.own_user_id
    }

    /// Get the type of the room.
    pub fn room_type(&self) -> RoomType {
        self.inner.read().room_type
    }

    /// The `m.room.name` of the room, if it has one.
    pub fn name(&self) -> Option<String> {
        self.inner.read().name.clone()
    }

    /// The `m.room.topic` of the room, if it has one.
    pub fn topic(&self) -> Option<String> {
        self.inner.read().topic.clone()
    }

    /// Is the room encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.inner.read().is_encrypted()
    }

    /// Get the `m.room.encryption` content that enabled end to end encryption
    /// in the room.
    pub fn encryption_settings(&self) -> Option<RoomEncryptionEventContent> {
        self.inner.read().encryption.clone()
    }

    /// The pagination token that fetches events older than the oldest one we
    /// hold.
    pub fn prev_batch(&self) -> Option<String> {
        self.inner.read().prev_batch.clone()
    }

    /// The users that are joined or invited to the room.
    pub fn active_members(&self) -> Vec<OwnedUserId> {
        self.inner.read().active_members().map(ToOwned::to_owned).collect()
    }

    /// The users that are joined to the room.
    pub fn joined_members(&self) -> Vec<OwnedUserId> {
        self.inner
            .read()
            .members
            .iter()
            .filter(|(_, m)| **m == MembershipState::Join)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Get the membership of the given user, if we've seen one.
    pub fn membership(&self, user_id: &UserId) -> Option<MembershipState> {
        self.inner.read().members.get(user_id).cloned()
    }

    /// Clone the inner RoomInfo
    pub fn clone_info(&self) -> RoomInfo {
        self.inner.read().clone()
    }

    /// Update the summary with given RoomInfo
    pub fn set_room_info(&self, room_info: RoomInfo) {
        *self.inner.write() = room_info;
    }

    /// Get a copy of the timeline of the room, oldest event first.
    pub fn timeline(&self) -> Vec<SyncTimelineEvent> {
        self.timeline.read().events.iter().cloned().collect()
    }

    /// Do we already hold the event with the given ID in the timeline.
    pub fn has_event(&self, event_id: &EventId) -> bool {
        self.timeline.read().event_ids.contains(event_id)
    }

    /// Append events coming from a sync to the end of the timeline.
    ///
    /// Events we already hold are skipped.
    pub(crate) fn append_timeline(&self, events: impl IntoIterator<Item = SyncTimelineEvent>) {
        let mut timeline = self.timeline.write();

        for event in events {
            if !timeline.contains(&event) {
                timeline.remember(&event);
                timeline.events.push_back(event);
            }
        }
    }

    /// Prepend events coming from a backwards pagination request.
    ///
    /// The events need to be in reverse chronological order, newest event
    /// first, as the server returns them.
    pub(crate) fn prepend_timeline(&self, events: impl IntoIterator<Item = SyncTimelineEvent>) {
        let mut timeline = self.timeline.write();

        for event in events {
            if !timeline.contains(&event) {
                timeline.remember(&event);
                timeline.events.push_front(event);
            }
        }
    }

    /// Forget the local timeline, used when the server tells us that there's a
    /// gap between what we hold and the new events.
    pub(crate) fn reset_timeline(&self) {
        let mut timeline = self.timeline.write();
        timeline.events.clear();
        timeline.event_ids.clear();
    }

    /// Get the raw state event of the given type and state key.
    pub async fn get_state_event(
        &self,
        event_type: &str,
        state_key: &str,
    ) -> StoreResult<Option<JsonValue>> {
        self.store.get_state_event(self.room_id(), event_type, state_key).await
    }

    /// Get all the raw state events of the given type.
    pub async fn get_state_events(&self, event_type: &str) -> StoreResult<Vec<JsonValue>> {
        self.store.get_state_events(self.room_id(), event_type).await
    }

    /// Get the raw member event of the given user.
    pub async fn get_member_event(&self, user_id: &UserId) -> StoreResult<Option<JsonValue>> {
        self.get_state_event(ROOM_MEMBER, user_id.as_str()).await
    }
}
