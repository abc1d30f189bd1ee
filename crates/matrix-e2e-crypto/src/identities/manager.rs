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

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    identities::{DeviceData, LocalTrust},
    requests::{KeysQueryRequest, KeysQueryResponse},
    store::{DeviceChanges, Result as StoreResult, Store},
};

enum DeviceChange {
    New(DeviceData),
    Updated(DeviceData),
    None,
}

/// Keeps track of the users whose device lists we need and turns
/// `/keys/query` responses into device directory updates.
#[derive(Debug, Clone)]
pub(crate) struct IdentityManager {
    store: Store,
    /// Tracked users, mapped to a flag telling if their device list is
    /// outdated.
    tracked_users: Arc<Mutex<BTreeMap<OwnedUserId, bool>>>,
}

impl IdentityManager {
    pub fn new(store: Store, tracked_users: BTreeMap<OwnedUserId, bool>) -> Self {
        Self { store, tracked_users: Arc::new(Mutex::new(tracked_users)) }
    }

    /// Start tracking the device lists of the given users, newly tracked
    /// users are marked as outdated.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let mut tracked_users = self.tracked_users.lock().await;
        let mut changed = false;

        for user_id in users {
            if !tracked_users.contains_key(user_id) {
                trace!(?user_id, "Start tracking the device list of a user");
                tracked_users.insert(user_id.to_owned(), true);
                changed = true;
            }
        }

        if changed {
            self.store.save_tracked_users(&tracked_users).await?;
        }

        Ok(())
    }

    /// Mark the device lists of the given users as outdated, users we don't
    /// track are ignored.
    pub async fn mark_users_as_changed(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        let mut tracked_users = self.tracked_users.lock().await;
        let mut changed = false;

        for user_id in users {
            if let Some(dirty) = tracked_users.get_mut(user_id) {
                *dirty = true;
                changed = true;
            }
        }

        if changed {
            self.store.save_tracked_users(&tracked_users).await?;
        }

        Ok(())
    }

    /// Stop tracking the device lists of the given users.
    pub async fn stop_tracking(&self, users: impl IntoIterator<Item = &UserId>) -> StoreResult<()> {
        let mut tracked_users = self.tracked_users.lock().await;
        let before = tracked_users.len();

        for user_id in users {
            tracked_users.remove(user_id);
        }

        if before != tracked_users.len() {
            self.store.save_tracked_users(&tracked_users).await?;
        }

        Ok(())
    }

    pub async fn tracked_users(&self) -> Vec<OwnedUserId> {
        self.tracked_users.lock().await.keys().cloned().collect()
    }

    /// Get a `/keys/query` request for the users with an outdated device
    /// list, `None` if every device list is up to date.
    pub async fn users_for_key_query(&self) -> Option<KeysQueryRequest> {
        let users: Vec<_> = self
            .tracked_users
            .lock()
            .await
            .iter()
            .filter(|(_, dirty)| **dirty)
            .map(|(user_id, _)| user_id.clone())
            .collect();

        if users.is_empty() {
            None
        } else {
            debug!(?users, "Users need a device list refresh");
            Some(KeysQueryRequest::new(users))
        }
    }

    /// Build a `/keys/query` request for the given users, no matter if their
    /// device lists are up to date.
    pub fn build_key_query_for_users<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
    ) -> KeysQueryRequest {
        KeysQueryRequest::new(users.into_iter().map(ToOwned::to_owned))
    }

    fn update_or_create_device(
        &self,
        stored: &BTreeMap<OwnedDeviceId, DeviceData>,
        device: DeviceData,
    ) -> DeviceChange {
        if let Some(old_device) = stored.get(device.device_id()) {
            let mut old_device = old_device.clone();

            match old_device.update_device(&device) {
                Ok(true) => DeviceChange::Updated(old_device),
                Ok(false) => DeviceChange::None,
                Err(e) => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        error = ?e,
                        "Failed to update device keys, keeping the previously known keys",
                    );

                    DeviceChange::None
                }
            }
        } else if device.user_id() == self.store.user_id()
            && device.device_id() == self.store.device_id()
        {
            // The server may not lie about our own device, only accept it if
            // the keys are ours and mark it as verified.
            let identity_keys = self.store.identity_keys();

            if device.ed25519_key() == Some(identity_keys.ed25519)
                && device.curve25519_key() == Some(identity_keys.curve25519)
            {
                device.set_trust_state(LocalTrust::Verified);

                trace!(
                    user_id = device.user_id().as_str(),
                    device_id = device.device_id().as_str(),
                    "Adding our own device to the device store, marking it as locally verified",
                );

                DeviceChange::New(device)
            } else {
                warn!(
                    device_id = device.device_id().as_str(),
                    "The server returned keys for our own device that don't match our identity keys"
                );

                DeviceChange::None
            }
        } else {
            trace!(
                user_id = device.user_id().as_str(),
                device_id = device.device_id().as_str(),
                keys = ?device.keys(),
                "Adding a new device to the device store",
            );

            DeviceChange::New(device)
        }
    }

    async fn update_user_devices(
        &self,
        user_id: &UserId,
        device_map: &BTreeMap<OwnedDeviceId, Value>,
    ) -> StoreResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();
        let stored = self.store.get_user_devices_data(user_id).await?;

        for (device_id, device_keys) in device_map {
            let device = match DeviceData::from_signed_json(device_keys) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        ?user_id,
                        ?device_id,
                        error = ?e,
                        "Device keys failed the signature check"
                    );
                    continue;
                }
            };

            if device.user_id() != user_id || device.device_id() != device_id {
                warn!(
                    ?user_id,
                    ?device_id,
                    device_user_id = ?device.user_id(),
                    device_device_id = ?device.device_id(),
                    "Mismatch in the device keys payload",
                );
                continue;
            }

            match self.update_or_create_device(&stored, device) {
                DeviceChange::New(d) => changes.new.push(d),
                DeviceChange::Updated(d) => changes.changed.push(d),
                DeviceChange::None => (),
            }
        }

        let current_devices: BTreeSet<&OwnedDeviceId> = device_map.keys().collect();

        for (device_id, device) in &stored {
            let is_own_device =
                user_id == self.store.user_id() && <OwnedDeviceId as AsRef<DeviceId>>::as_ref(device_id) == self.store.device_id();

            if !current_devices.contains(device_id) && !is_own_device {
                debug!(?user_id, ?device_id, "The device was deleted, removing it");
                changes.deleted.push(device.clone());
            }
        }

        Ok(changes)
    }

    /// Receive a successful `/keys/query` response.
    ///
    /// Returns a list of devices that changed. Changed here means either
    /// they are new, one of their properties has changed or they got deleted.
    #[instrument(skip_all)]
    pub async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> StoreResult<DeviceChanges> {
        if !response.failures.is_empty() {
            info!(
                failures = ?response.failures,
                "Failed to download the device keys of some servers"
            );
        }

        let mut changes = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            let user_changes = self.update_user_devices(user_id, device_map).await?;
            changes.new.extend(user_changes.new);
            changes.changed.extend(user_changes.changed);
            changes.deleted.extend(user_changes.deleted);
        }

        self.store.save_device_changes(changes.clone()).await?;

        let mut tracked_users = self.tracked_users.lock().await;

        for user_id in response.device_keys.keys() {
            if let Some(dirty) = tracked_users.get_mut(user_id) {
                *dirty = false;
            }
        }

        self.store.save_tracked_users(&tracked_users).await?;

        debug!(
            new = changes.new.len(),
            changed = changes.changed.len(),
            deleted = changes.deleted.len(),
            "Finished handling of the keys query response"
        );

        Ok(changes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use ruma::{device_id, user_id, DeviceId, UserId};
    use serde_json::json;

    use super::IdentityManager;
    use crate::{
        identities::device::testing::device_keys_json,
        olm::Account,
        requests::KeysQueryResponse,
        store::{MemoryStore, PickleKey, Store},
    };

    pub fn example_user_id() -> &'static UserId {
        user_id!("@example:localhost")
    }

    pub fn example_device_id() -> &'static DeviceId {
        device_id!("WSKKLTJZCL")
    }

    pub fn manager() -> IdentityManager {
        let account = Account::new(example_user_id(), example_device_id());
        let store = Store::new(
            example_user_id().to_owned(),
            example_device_id().to_owned(),
            account.identity_keys(),
            PickleKey::new(),
            Arc::new(MemoryStore::new()),
        );

        IdentityManager::new(store, Default::default())
    }

    pub fn keys_query_response() -> KeysQueryResponse {
        serde_json::from_value(json!({
            "device_keys": {
                "@example:localhost": {
                    "BNYQQWUMXO": device_keys_json(),
                },
            },
            "failures": {},
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::testing::{example_user_id, keys_query_response, manager};
    use crate::{
        identities::device::testing::device_keys_json, olm::Account, requests::KeysQueryResponse,
    };

    #[tokio::test]
    async fn test_tracked_users_need_a_key_query() {
        let manager = manager();
        let alice = user_id!("@alice:example.org");

        assert!(manager.users_for_key_query().await.is_none());

        manager.update_tracked_users([alice]).await.unwrap();
        let request = manager.users_for_key_query().await.unwrap();
        assert!(request.device_keys.contains_key(alice));

        manager.mark_users_as_changed([user_id!("@untracked:example.org")]).await.unwrap();
        assert_eq!(manager.tracked_users().await, vec![alice.to_owned()]);

        manager.stop_tracking([alice]).await.unwrap();
        assert!(manager.users_for_key_query().await.is_none());
    }

    #[tokio::test]
    async fn test_keys_query_response_adds_devices() {
        let manager = manager();
        manager.update_tracked_users([example_user_id()]).await.unwrap();

        let changes = manager.receive_keys_query_response(&keys_query_response()).await.unwrap();

        assert_eq!(changes.new.len(), 1);
        assert!(changes.changed.is_empty());
        assert!(manager.users_for_key_query().await.is_none());

        let device =
            manager.store.get_device_data(example_user_id(), device_id!("BNYQQWUMXO")).await.unwrap();
        assert!(device.is_some());

        let changes = manager.receive_keys_query_response(&keys_query_response()).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_changed_fingerprint_keeps_old_device() {
        let manager = manager();
        manager.receive_keys_query_response(&keys_query_response()).await.unwrap();

        // A validly self-signed device that reuses the device id with new keys.
        let impostor = Account::new(example_user_id(), device_id!("BNYQQWUMXO"));
        let response: KeysQueryResponse = serde_json::from_value(json!({
            "device_keys": {
                "@example:localhost": { "BNYQQWUMXO": impostor.device_keys().unwrap() },
            },
        }))
        .unwrap();

        let changes = manager.receive_keys_query_response(&response).await.unwrap();
        assert!(changes.is_empty());

        let device = manager
            .store
            .get_device_data(example_user_id(), device_id!("BNYQQWUMXO"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            device.ed25519_key().unwrap().to_base64(),
            "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
        );
    }

    #[tokio::test]
    async fn test_forged_device_is_skipped() {
        let manager = manager();

        let mut forged = device_keys_json();
        forged["keys"]["curve25519:BNYQQWUMXO"] = "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc".into();

        let response: KeysQueryResponse = serde_json::from_value(json!({
            "device_keys": { "@example:localhost": { "BNYQQWUMXO": forged } },
        }))
        .unwrap();

        let changes = manager.receive_keys_query_response(&response).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_absent_devices_get_deleted() {
        let manager = manager();
        manager.receive_keys_query_response(&keys_query_response()).await.unwrap();

        let response: KeysQueryResponse = serde_json::from_value(json!({
            "device_keys": { "@example:localhost": {} },
        }))
        .unwrap();

        let changes = manager.receive_keys_query_response(&response).await.unwrap();
        assert_eq!(changes.deleted.len(), 1);

        assert!(manager
            .store
            .get_device_data(example_user_id(), device_id!("BNYQQWUMXO"))
            .await
            .unwrap()
            .is_none());
    }
}
