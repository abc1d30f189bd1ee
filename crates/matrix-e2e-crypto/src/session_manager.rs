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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::OlmResult,
    olm::Account,
    requests::{KeysClaimOutcome, KeysClaimRequest, KeysClaimResponse},
    store::{Result as StoreResult, Store},
};

/// Figures out which devices we lack an Olm session with and turns claimed
/// one-time keys into new outbound sessions.
#[derive(Debug, Clone)]
pub(crate) struct SessionManager {
    account: Arc<Mutex<Account>>,
    store: Store,
}

impl SessionManager {
    pub fn new(account: Arc<Mutex<Account>>, store: Store) -> Self {
        Self { account, store }
    }

    /// Get the devices of the given users that we don't share an Olm session
    /// with yet.
    ///
    /// Our own device, blocked devices and devices without a Curve25519 key
    /// are skipped.
    pub async fn get_missing_sessions(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>> {
        let mut missing: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = BTreeMap::new();

        for user_id in users {
            let devices = self.store.get_user_devices_data(user_id).await?;

            for (device_id, device) in devices {
                let is_own_device = user_id == self.store.user_id()
                    && <OwnedDeviceId as AsRef<DeviceId>>::as_ref(&device_id) == self.store.device_id();

                if is_own_device || device.is_blocked() {
                    continue;
                }

                let Some(sender_key) = device.curve25519_key() else {
                    warn!(?user_id, ?device_id, "The device doesn't have a Curve25519 key");
                    continue;
                };

                let has_session = match self.store.get_sessions(&sender_key.to_base64()).await? {
                    Some(sessions) => !sessions.lock().await.is_empty(),
                    None => false,
                };

                if !has_session {
                    missing.entry(user_id.to_owned()).or_default().push(device_id);
                }
            }
        }

        Ok(missing)
    }

    /// Build a `/keys/claim` request for the devices of the given users we
    /// lack a session with, `None` if there are no such devices.
    pub async fn keys_claim_request(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<Option<KeysClaimRequest>> {
        let missing = self.get_missing_sessions(users).await?;

        if missing.is_empty() {
            Ok(None)
        } else {
            debug!(?missing, "Collected devices that need an Olm session");
            Ok(Some(KeysClaimRequest::new(missing)))
        }
    }

    /// Receive a successful `/keys/claim` response and create new Olm sessions
    /// with the claimed keys.
    ///
    /// Devices we asked a key for but didn't get one, as well as devices for
    /// which the session creation failed, are reported as missing.
    #[instrument(skip_all)]
    pub async fn receive_keys_claim_response(
        &self,
        request: &KeysClaimRequest,
        response: &KeysClaimResponse,
    ) -> OlmResult<KeysClaimOutcome> {
        if !response.failures.is_empty() {
            info!(failures = ?response.failures, "Some servers failed to return one-time keys");
        }

        let mut outcome = KeysClaimOutcome::default();

        for (user_id, devices) in &request.one_time_keys {
            for device_id in devices.keys() {
                let key_map = response
                    .one_time_keys
                    .get(user_id)
                    .and_then(|d| d.get(device_id))
                    .filter(|k| !k.is_empty());

                let Some(key_map) = key_map else {
                    debug!(?user_id, ?device_id, "No one-time key was claimed for the device");
                    outcome
                        .missing_devices
                        .entry(user_id.clone())
                        .or_default()
                        .push(device_id.clone());
                    continue;
                };

                let Some(device) = self.store.get_device_data(user_id, device_id).await? else {
                    warn!(
                        ?user_id,
                        ?device_id,
                        "Tried to create an Olm session but the device is unknown",
                    );
                    outcome
                        .missing_devices
                        .entry(user_id.clone())
                        .or_default()
                        .push(device_id.clone());
                    continue;
                };

                let result = self.account.lock().await.create_outbound_session(&device, key_map);

                let session = match result {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(
                            ?user_id,
                            ?device_id,
                            error = ?e,
                            "Error creating an outbound session"
                        );
                        outcome
                            .missing_devices
                            .entry(user_id.clone())
                            .or_default()
                            .push(device_id.clone());
                        continue;
                    }
                };

                let session_id = session.session_id().to_owned();
                let sender_key = session.sender_key().to_base64();

                let sessions = self.store.get_or_create_sessions(&sender_key).await?;
                let mut sessions = sessions.lock().await;
                self.store.add_session(&mut sessions, session).await?;

                info!(?user_id, ?device_id, session_id, "Created a new outbound Olm session");

                outcome
                    .created
                    .entry(user_id.clone())
                    .or_default()
                    .insert(device_id.clone(), session_id);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use serde_json::json;
    use tokio::sync::Mutex;

    use super::SessionManager;
    use crate::{
        identities::{DeviceData, LocalTrust},
        olm::{
            tests::{alice_device_id, alice_id, bob_device_id, bob_id},
            Account,
        },
        requests::KeysClaimResponse,
        store::{MemoryStore, PickleKey, Store},
    };

    fn session_manager(account: Account) -> SessionManager {
        let store = Store::new(
            account.user_id().to_owned(),
            account.device_id().to_owned(),
            account.identity_keys(),
            PickleKey::new(),
            Arc::new(MemoryStore::new()),
        );

        SessionManager::new(Arc::new(Mutex::new(account)), store)
    }

    #[tokio::test]
    async fn test_session_creation_from_claimed_keys() {
        let manager = session_manager(Account::new(alice_id(), alice_device_id()));
        let mut bob = Account::new(bob_id(), bob_device_id());
        let bob_device = DeviceData::from_account(&bob).unwrap();
        bob_device.set_trust_state(LocalTrust::Unverified);

        manager.store.save_devices(vec![bob_device]).await.unwrap();

        let request = manager.keys_claim_request([bob_id()]).await.unwrap().unwrap();
        assert!(request.one_time_keys[bob_id()].contains_key(bob_device_id()));

        bob.generate_one_time_keys(1);
        let one_time_keys = bob.signed_one_time_keys().unwrap();
        bob.mark_keys_as_published();

        let response: KeysClaimResponse = serde_json::from_value(json!({
            "one_time_keys": {
                bob_id().as_str(): { bob_device_id().as_str(): one_time_keys },
            },
        }))
        .unwrap();

        let outcome = manager.receive_keys_claim_response(&request, &response).await.unwrap();

        assert!(outcome.missing_devices.is_empty());
        assert!(outcome.created[bob_id()].contains_key(bob_device_id()));
        assert!(manager.keys_claim_request([bob_id()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_devices_without_keys_are_reported_as_missing() {
        let manager = session_manager(Account::new(alice_id(), alice_device_id()));
        let bob = Account::new(bob_id(), bob_device_id());
        manager.store.save_devices(vec![DeviceData::from_account(&bob).unwrap()]).await.unwrap();

        let request = manager.keys_claim_request([bob_id()]).await.unwrap().unwrap();
        let outcome =
            manager.receive_keys_claim_response(&request, &KeysClaimResponse::default()).await.unwrap();

        assert!(outcome.created.is_empty());
        assert_eq!(
            outcome.missing_devices,
            BTreeMap::from([(bob_id().to_owned(), vec![bob_device_id().to_owned()])])
        );
    }

    #[tokio::test]
    async fn test_own_and_blocked_devices_are_skipped() {
        let alice = Account::new(alice_id(), alice_device_id());
        let own_device = DeviceData::from_account(&alice).unwrap();
        let manager = session_manager(alice);

        let bob = Account::new(bob_id(), bob_device_id());
        let bob_device = DeviceData::from_account(&bob).unwrap();
        bob_device.set_trust_state(LocalTrust::Blocked);

        manager.store.save_devices(vec![own_device, bob_device]).await.unwrap();

        let missing = manager.get_missing_sessions([alice_id(), bob_id()]).await.unwrap();
        assert!(missing.is_empty());
    }
}
