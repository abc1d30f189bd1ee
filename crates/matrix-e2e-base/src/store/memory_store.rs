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

use async_trait::async_trait;
use matrix_e2e_common::locks::RwLock as StdRwLock;
use ruma::{OwnedRoomId, RoomId};
use serde_json::Value as JsonValue;

use super::{Result, StateChanges, StateStore};
use crate::rooms::RoomInfo;

type StateMap = BTreeMap<OwnedRoomId, BTreeMap<String, BTreeMap<String, JsonValue>>>;

/// In-memory, non-persistent implementation of the `StateStore`.
///
/// Default if no other is configured at startup.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sync_token: StdRwLock<Option<String>>,
    room_info: StdRwLock<BTreeMap<OwnedRoomId, RoomInfo>>,
    room_state: StdRwLock<StateMap>,
}

impl MemoryStore {
    /// Create a new empty MemoryStore
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_changes(&self, changes: &StateChanges) -> Result<()> {
        if let Some(token) = &changes.sync_token {
            *self.sync_token.write() = Some(token.clone());
        }

        {
            let mut room_state = self.room_state.write();
            for (room, event_types) in &changes.state {
                for (event_type, events) in event_types {
                    for (state_key, event) in events {
                        room_state
                            .entry(room.clone())
                            .or_default()
                            .entry(event_type.clone())
                            .or_default()
                            .insert(state_key.clone(), event.clone());
                    }
                }
            }
        }

        let mut room_info = self.room_info.write();
        for (room_id, info) in &changes.room_infos {
            room_info.insert(room_id.clone(), info.clone());
        }

        Ok(())
    }

    async fn get_sync_token(&self) -> Result<Option<String>> {
        Ok(self.sync_token.read().clone())
    }

    async fn get_room_infos(&self) -> Result<Vec<RoomInfo>> {
        Ok(self.room_info.read().values().cloned().collect())
    }

    async fn get_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<JsonValue>> {
        Ok(self
            .room_state
            .read()
            .get(room_id)
            .and_then(|types| types.get(event_type))
            .and_then(|events| events.get(state_key))
            .cloned())
    }

    async fn get_state_events(
        &self,
        room_id: &RoomId,
        event_type: &str,
    ) -> Result<Vec<JsonValue>> {
        Ok(self
            .room_state
            .read()
            .get(room_id)
            .and_then(|types| types.get(event_type))
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;

    async fn get_store(_name: &str) -> MemoryStore {
        MemoryStore::new()
    }

    crate::statestore_integration_tests!();
}
