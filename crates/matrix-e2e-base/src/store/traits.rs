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

use std::sync::Arc;

use async_trait::async_trait;
use matrix_e2e_common::AsyncTraitDeps;
use ruma::RoomId;
use serde_json::Value as JsonValue;

use super::{Result, StateChanges};
use crate::rooms::RoomInfo;

/// An abstract state store trait that can be used to implement different
/// stores for the SDK.
#[async_trait]
pub trait StateStore: AsyncTraitDeps {
    /// Save the set of state changes in the store.
    ///
    /// The changes are applied atomically, either all of them end up in the
    /// store or none of them do.
    async fn save_changes(&self, changes: &StateChanges) -> Result<()>;

    /// Get the sync token of the last successfully processed sync response.
    async fn get_sync_token(&self) -> Result<Option<String>>;

    /// Get the infos of all the rooms we know about.
    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>>;

    /// Get a state event out of the state store.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The id of the room the state event was received for.
    ///
    /// * `event_type` - The event type of the state event.
    ///
    /// * `state_key` - The state key of the event.
    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<JsonValue>>;

    /// Get all the state events of the given type in a room.
    async fn get_state_events(&self, room_id: &RoomId, event_type: &str)
        -> Result<Vec<JsonValue>>;
}

/// A type-erased [`StateStore`].
pub type DynStateStore = dyn StateStore;

/// A type that can be type-erased into `Arc<DynStateStore>`.
///
/// Implemented for every `StateStore` and for `Arc`s of them.
pub trait IntoStateStore {
    #[doc(hidden)]
    fn into_state_store(self) -> Arc<DynStateStore>;
}

impl<T> IntoStateStore for T
where
    T: StateStore + 'static,
{
    fn into_state_store(self) -> Arc<DynStateStore> {
        Arc::new(self)
    }
}

impl<T> IntoStateStore for Arc<T>
where
    T: StateStore + 'static,
{
    fn into_state_store(self) -> Arc<DynStateStore> {
        self
    }
}

impl IntoStateStore for Arc<DynStateStore> {
    fn into_state_store(self) -> Arc<DynStateStore> {
        self
    }
}
