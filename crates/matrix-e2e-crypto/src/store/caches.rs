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

//! Collection of small in-memory stores that can be used to cache Olm objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

use std::{collections::BTreeMap, sync::Arc};

use matrix_e2e_common::locks::RwLock as StdRwLock;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::Mutex;

use crate::{identities::DeviceData, olm::Session};

/// In-memory store for Olm Sessions.
///
/// The sessions of a peer live behind a single async mutex, the ratchet of a
/// session is only ever advanced while it is held. The list is kept sorted by
/// session id.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    entries: Arc<StdRwLock<BTreeMap<String, Arc<Mutex<Vec<Session>>>>>>,
}

impl SessionStore {
    /// Create a new empty Session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all the sessions that belong to the given sender key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.read().get(sender_key).cloned()
    }

    /// Add a list of sessions belonging to the sender key to the cache.
    ///
    /// If another task already populated the entry, the existing list wins
    /// and is returned.
    pub fn set_for_sender(
        &self,
        sender_key: &str,
        mut sessions: Vec<Session>,
    ) -> Arc<Mutex<Vec<Session>>> {
        sessions.sort_by(|a, b| a.session_id().cmp(b.session_id()));

        self.entries
            .write()
            .entry(sender_key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(sessions)))
            .clone()
    }
}

/// Insert a session into a list of sessions, keeping the list sorted by
/// session id.
///
/// Returns false if a session with the same id was already part of the list.
pub(crate) fn insert_sorted(sessions: &mut Vec<Session>, session: Session) -> bool {
    match sessions.binary_search_by(|s| s.session_id().cmp(session.session_id())) {
        Ok(_) => false,
        Err(position) => {
            sessions.insert(position, session);
            true
        }
    }
}

/// In-memory store holding the devices of users.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    entries: Arc<StdRwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>>>,
}

impl DeviceStore {
    /// Create a new empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the devices of the given user, `None` if the user wasn't loaded
    /// into the cache yet.
    pub fn user_devices(&self, user_id: &UserId) -> Option<BTreeMap<OwnedDeviceId, DeviceData>> {
        self.entries.read().get(user_id).cloned()
    }

    /// Get the device with the given device_id and belonging to the given
    /// user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceData> {
        self.entries.read().get(user_id).and_then(|d| d.get(device_id).cloned())
    }

    /// Replace the devices of the given user.
    pub fn set_user_devices(&self, user_id: &UserId, devices: BTreeMap<OwnedDeviceId, DeviceData>) {
        self.entries.write().insert(user_id.to_owned(), devices);
    }

    /// Populate the cache for the given user unless another task already did
    /// so, returns the cached devices.
    pub fn load_user_devices(
        &self,
        user_id: &UserId,
        devices: BTreeMap<OwnedDeviceId, DeviceData>,
    ) -> BTreeMap<OwnedDeviceId, DeviceData> {
        self.entries.write().entry(user_id.to_owned()).or_insert(devices).clone()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::{insert_sorted, DeviceStore, SessionStore};
    use crate::{identities::device::testing::get_device, olm::tests::get_account_and_session};

    #[tokio::test]
    async fn test_session_store() {
        let (_, _, session) = get_account_and_session();
        let (_, _, other) = get_account_and_session();

        let store = SessionStore::new();
        let sender_key = session.sender_key().to_base64();

        assert!(store.get(&sender_key).is_none());

        let sessions = store.set_for_sender(&sender_key, vec![session.clone()]);
        assert!(!insert_sorted(&mut *sessions.lock().await, session.clone()));
        assert!(insert_sorted(&mut *sessions.lock().await, other.clone()));

        let sessions = store.get(&sender_key).unwrap();
        let sessions = sessions.lock().await;
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].session_id() < sessions[1].session_id());
    }

    #[test]
    fn test_device_store() {
        let device = get_device();
        let store = DeviceStore::new();

        assert!(store.user_devices(device.user_id()).is_none());

        let loaded = store.load_user_devices(
            device.user_id(),
            [(device.device_id().to_owned(), device.clone())].into(),
        );
        assert_eq!(loaded.len(), 1);

        let loaded_device = store.get(device.user_id(), device.device_id()).unwrap();
        assert_eq!(device, loaded_device);

        store.set_user_devices(device.user_id(), Default::default());
        assert!(store.get(device.user_id(), device.device_id()).is_none());
        assert!(store.get(user_id!("@other:localhost"), device_id!("DEVICE")).is_none());
    }
}
