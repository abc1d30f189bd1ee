// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::collections::HashMap;

use async_trait::async_trait;
use matrix_e2e_common::locks::RwLock as StdRwLock;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};

use super::{CryptoStore, Result};

/// An in-memory only store that will forget all the E2EE key once it's
/// dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: StdRwLock<HashMap<OwnedDeviceId, String>>,
    sessions: StdRwLock<HashMap<String, String>>,
    devices: StdRwLock<HashMap<OwnedUserId, String>>,
    room_settings: StdRwLock<HashMap<OwnedRoomId, String>>,
    tracked_users: StdRwLock<Option<String>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self, device_id: &DeviceId) -> Result<Option<String>> {
        Ok(self.accounts.read().get(device_id).cloned())
    }

    async fn save_account(&self, device_id: &DeviceId, account: String) -> Result<()> {
        self.accounts.write().insert(device_id.to_owned(), account);
        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<String>> {
        Ok(self.sessions.read().get(sender_key).cloned())
    }

    async fn save_sessions(&self, sender_key: &str, sessions: String) -> Result<()> {
        self.sessions.write().insert(sender_key.to_owned(), sessions);
        Ok(())
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<Option<String>> {
        Ok(self.devices.read().get(user_id).cloned())
    }

    async fn save_user_devices(&self, user_id: &UserId, devices: String) -> Result<()> {
        self.devices.write().insert(user_id.to_owned(), devices);
        Ok(())
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<String>> {
        Ok(self.room_settings.read().get(room_id).cloned())
    }

    async fn save_room_settings(&self, room_id: &RoomId, settings: String) -> Result<()> {
        self.room_settings.write().insert(room_id.to_owned(), settings);
        Ok(())
    }

    async fn remove_room_settings(&self, room_id: &RoomId) -> Result<()> {
        self.room_settings.write().remove(room_id);
        Ok(())
    }

    async fn load_tracked_users(&self) -> Result<Option<String>> {
        Ok(self.tracked_users.read().clone())
    }

    async fn save_tracked_users(&self, users: String) -> Result<()> {
        *self.tracked_users.write() = Some(users);
        Ok(())
    }
}
