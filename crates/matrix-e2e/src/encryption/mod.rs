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

//! End-to-end encryption related types
//!
//! The [`Encryption`] manager uploads our identity and one-time keys, keeps
//! the device lists of other users up to date and establishes Olm sessions
//! with their devices. Rooms use it when encryption is enabled or a message
//! gets sent, the sync loop uses it to send out pending key requests.

use std::collections::{BTreeMap, BTreeSet};

use futures_util::future::join;
use matrix_e2e_crypto::{
    DeviceChanges, DeviceData, KeysClaimOutcome, KeysClaimRequest, KeysClaimResponse,
    KeysQueryRequest, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, LocalTrust,
    OlmMachine,
};
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{http_client::ApiRequest, Client, Error, Result};

mod devices;

pub use self::devices::{Device, UserDevices};

/// Notifications about changes of the end-to-end encryption state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoEvent {
    /// The device lists of some users were downloaded and changed.
    DevicesUpdated(DeviceUpdates),
    /// The local trust state of a device was changed.
    DeviceTrustChanged {
        /// The owner of the device.
        user_id: OwnedUserId,
        /// The device whose trust state changed.
        device_id: OwnedDeviceId,
        /// The new trust state.
        trust: LocalTrust,
    },
    /// New one-time keys were published.
    OneTimeKeysUploaded {
        /// How many keys were uploaded.
        uploaded: usize,
        /// How many unclaimed one-time keys the server holds for us now.
        server_count: u64,
    },
}

/// The devices that appeared, changed or disappeared after a `/keys/query`
/// response, grouped by their owner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceUpdates {
    /// Devices we didn't know about before.
    pub new: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    /// Devices whose display name or algorithms changed.
    pub changed: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    /// Devices the server doesn't list anymore.
    pub deleted: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

impl DeviceUpdates {
    /// Did anything change.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// The users whose device list changed.
    pub fn users(&self) -> BTreeSet<OwnedUserId> {
        self.new.keys().chain(self.changed.keys()).chain(self.deleted.keys()).cloned().collect()
    }
}

impl From<&DeviceChanges> for DeviceUpdates {
    fn from(changes: &DeviceChanges) -> Self {
        fn group(devices: &[DeviceData]) -> BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> {
            let mut grouped: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = BTreeMap::new();

            for device in devices {
                grouped
                    .entry(device.user_id().to_owned())
                    .or_default()
                    .push(device.device_id().to_owned());
            }

            grouped
        }

        Self {
            new: group(&changes.new),
            changed: group(&changes.changed),
            deleted: group(&changes.deleted),
        }
    }
}

/// What a call to [`Encryption::upload_keys`] published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeysUploadOutcome {
    /// Were our device keys uploaded by this call.
    pub device_keys_uploaded: bool,
    /// The number of one-time keys uploaded by this call.
    pub one_time_keys_uploaded: usize,
    /// How many unclaimed one-time keys the server holds for us.
    pub server_count: u64,
}

/// A high-level API to manage the client's encryption.
///
/// To get this, use [`Client::encryption()`].
#[derive(Debug, Clone)]
pub struct Encryption {
    /// The underlying client.
    client: Client,
}

impl Encryption {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn olm_machine(&self) -> Result<&OlmMachine> {
        if !self.client.logged_in() {
            return Err(Error::AuthenticationRequired);
        }

        self.client.olm_machine().ok_or(Error::CryptoDisabled)
    }

    /// Get the public ed25519 key of our own device. This is usually what is
    /// called the fingerprint of the device.
    pub fn ed25519_key(&self) -> Option<String> {
        self.client.olm_machine().map(|o| o.identity_keys().ed25519.to_base64())
    }

    /// Get the public Curve25519 key of our own device.
    pub fn curve25519_key(&self) -> Option<String> {
        self.client.olm_machine().map(|o| o.identity_keys().curve25519.to_base64())
    }

    /// Get all the tracked users we know about
    ///
    /// Tracked users are users for which we keep the device list of E2EE
    /// capable devices up to date.
    pub async fn tracked_users(&self) -> Vec<OwnedUserId> {
        match self.client.olm_machine() {
            Some(machine) => machine.tracked_users().await,
            None => Vec::new(),
        }
    }

    /// Subscribe to changes of the end-to-end encryption state.
    pub fn subscribe_to_crypto_events(&self) -> broadcast::Receiver<CryptoEvent> {
        self.client.inner.crypto_event_sender.subscribe()
    }

    pub(crate) fn send_crypto_event(&self, event: CryptoEvent) {
        // Nobody listening is fine.
        let _ = self.client.inner.crypto_event_sender.send(event);
    }

    /// Get a specific device of a user.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that the device belongs to.
    ///
    /// * `device_id` - The unique id of the device.
    ///
    /// Returns a `Device` if one is found and the crypto store didn't throw an
    /// error. Only devices that were downloaded with a `/keys/query` request
    /// are known.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>> {
        let device = self.olm_machine()?.get_device(user_id, device_id).await?;
        Ok(device.map(|d| Device::new(d, self.client.clone())))
    }

    /// Get a map holding all the devices of an user.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that the devices belong to.
    pub async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        let devices = self.olm_machine()?.get_user_devices(user_id).await?;
        Ok(UserDevices::new(devices, self.client.clone()))
    }

    /// Publish our device keys and make sure the server holds enough of our
    /// one-time keys.
    ///
    /// The device keys are only uploaded once. If the server holds less than
    /// half of the one-time key pool, the first round tops it up to half the
    /// pool without any cap. A round that uploaded keys is followed by a
    /// single recheck, only that recheck is capped by `max_keys`.
    ///
    /// Concurrent calls are serialized, a call that finds nothing to do is
    /// cheap.
    ///
    /// # Arguments
    ///
    /// * `max_keys` - An upper bound for the number of keys the recheck may
    ///   generate. It doesn't limit the first round, `None` leaves the
    ///   recheck uncapped as well.
    pub async fn upload_keys(&self, max_keys: Option<usize>) -> Result<KeysUploadOutcome> {
        self.upload_keys_impl(max_keys, true).await
    }

    #[instrument(skip(self))]
    pub(crate) async fn upload_keys_impl(
        &self,
        max_keys: Option<usize>,
        first_time: bool,
    ) -> Result<KeysUploadOutcome> {
        let machine = self.olm_machine()?;
        let _guard = self.client.inner.key_upload_lock.lock().await;

        let mut outcome = KeysUploadOutcome::default();

        let server_count = if let Some(request) = machine.device_keys_upload_request().await? {
            outcome.device_keys_uploaded = true;
            self.keys_upload(machine, &request).await?
        } else if first_time {
            // The count we learned from the last sync might be stale, an empty
            // upload tells us the current one.
            self.keys_upload(machine, &KeysUploadRequest::default()).await?
        } else {
            machine.uploaded_key_count().await
        };
        outcome.server_count = server_count;

        if let Some(request) = machine.one_time_keys_upload_request(server_count, None).await? {
            outcome.one_time_keys_uploaded += request.one_time_keys.len();
            outcome.server_count = self.keys_upload(machine, &request).await?;

            if first_time {
                if let Some(request) =
                    machine.one_time_keys_upload_request(outcome.server_count, max_keys).await?
                {
                    debug!("The server still holds too few one-time keys, uploading more");

                    outcome.one_time_keys_uploaded += request.one_time_keys.len();
                    outcome.server_count = self.keys_upload(machine, &request).await?;
                }
            }
        }

        if outcome.one_time_keys_uploaded > 0 {
            info!(
                uploaded = outcome.one_time_keys_uploaded,
                server_count = outcome.server_count,
                "Published new one-time keys"
            );

            self.send_crypto_event(CryptoEvent::OneTimeKeysUploaded {
                uploaded: outcome.one_time_keys_uploaded,
                server_count: outcome.server_count,
            });
        }

        Ok(outcome)
    }

    async fn keys_upload(&self, machine: &OlmMachine, request: &KeysUploadRequest) -> Result<u64> {
        debug!(
            device_keys = request.device_keys.is_some(),
            one_time_key_count = request.one_time_keys.len(),
            "Uploading public encryption keys",
        );

        let body = serde_json::to_value(request)?;
        let response: KeysUploadResponse =
            self.client.send(ApiRequest::post(["keys", "upload"], body), None).await?;

        Ok(machine.receive_keys_upload_response(request, &response).await?)
    }

    /// Download the device lists of the given users.
    ///
    /// The users are tracked from now on, their device lists get refreshed
    /// whenever a sync reports a change. Without `force` only users whose
    /// device list is outdated are queried.
    ///
    /// Returns the device changes the download caused.
    #[instrument(skip_all)]
    pub async fn download_keys<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
        force: bool,
    ) -> Result<DeviceUpdates> {
        let machine = self.olm_machine()?;
        let users: Vec<&UserId> = users.into_iter().collect();

        machine.update_tracked_users(users.iter().copied()).await?;

        let request = if force {
            Some(machine.build_key_query_for_users(users.iter().copied()))
        } else {
            machine.users_for_key_query().await
        };

        match request {
            Some(request) if !request.device_keys.is_empty() => self.keys_query(request).await,
            _ => Ok(DeviceUpdates::default()),
        }
    }

    async fn keys_query(&self, request: KeysQueryRequest) -> Result<DeviceUpdates> {
        let machine = self.olm_machine()?;
        let _guard = self.client.inner.key_query_lock.lock().await;

        debug!(users = ?request.device_keys.keys().collect::<Vec<_>>(), "Querying device keys");

        let body = serde_json::to_value(&request)?;
        let response: KeysQueryResponse =
            self.client.send(ApiRequest::post(["keys", "query"], body), None).await?;

        if !response.failures.is_empty() {
            warn!(failures = ?response.failures, "Some servers couldn't be reached");
        }

        let changes = machine.receive_keys_query_response(&response).await?;
        let updates = DeviceUpdates::from(&changes);

        if !updates.is_empty() {
            self.send_crypto_event(CryptoEvent::DevicesUpdated(updates.clone()));
        }

        Ok(updates)
    }

    /// Claim a one-time key for each of the given devices and create Olm
    /// sessions from them.
    ///
    /// Devices for which the server returned no key, or whose key couldn't be
    /// used, are reported in the outcome instead of failing the whole batch.
    ///
    /// The request keeps running in the background even if the returned
    /// future is dropped, so the created sessions aren't lost.
    pub async fn claim_one_time_keys(
        &self,
        devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    ) -> Result<KeysClaimOutcome> {
        self.olm_machine()?;
        self.keys_claim(KeysClaimRequest::new(devices)).await
    }

    /// Make sure we share an Olm session with every known, non-blocked device
    /// of the given users.
    pub(crate) async fn establish_sessions<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
    ) -> Result<KeysClaimOutcome> {
        let machine = self.olm_machine()?;

        match machine.get_missing_sessions(users).await? {
            Some(request) => self.keys_claim(request).await,
            None => Ok(KeysClaimOutcome::default()),
        }
    }

    async fn keys_claim(&self, request: KeysClaimRequest) -> Result<KeysClaimOutcome> {
        if request.is_empty() {
            return Ok(KeysClaimOutcome::default());
        }

        let this = self.clone();

        tokio::spawn(async move {
            let machine = this.olm_machine()?;
            let _guard = this.client.inner.key_claim_lock.lock().await;

            debug!(
                devices = request.one_time_keys.values().map(BTreeMap::len).sum::<usize>(),
                "Claiming one-time keys"
            );

            let body = serde_json::to_value(&request)?;
            let response: KeysClaimResponse =
                this.client.send(ApiRequest::post(["keys", "claim"], body), None).await?;

            let outcome = machine.receive_keys_claim_response(&request, &response).await?;

            if !outcome.missing_devices.is_empty() {
                info!(
                    missing_devices = ?outcome.missing_devices,
                    "Couldn't claim a one-time key for some devices"
                );
            }

            Ok::<_, Error>(outcome)
        })
        .await
        .map_err(|_| Error::BackgroundTaskFailed)?
    }

    /// Send out the key uploads and device list queries the Olm machine
    /// wants.
    ///
    /// Failures are logged, they don't fail the sync that triggered them.
    pub(crate) async fn send_outgoing_requests(&self) -> Result<()> {
        let Some(machine) = self.client.olm_machine() else {
            return Ok(());
        };

        let upload = async {
            if machine.should_upload_keys().await {
                if let Err(e) = self.upload_keys_impl(None, false).await {
                    warn!(error = ?e, "Error when uploading our encryption keys");
                }
            }
        };

        let query = async {
            if let Some(request) = machine.users_for_key_query().await {
                if let Err(e) = self.keys_query(request).await {
                    warn!(error = ?e, "Error when querying device keys");
                }
            }
        };

        join(upload, query).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::DeviceUpdates;
    use crate::{test_utils::logged_in_client, Error};

    #[test]
    fn test_device_updates_group_by_user() {
        let mut updates = DeviceUpdates::default();
        assert!(updates.is_empty());

        let alice = user_id!("@alice:localhost").to_owned();
        let bob = user_id!("@bob:localhost").to_owned();

        updates.new.insert(alice.clone(), vec![device_id!("A").to_owned()]);
        updates.deleted.insert(bob.clone(), vec![device_id!("B").to_owned()]);

        assert!(!updates.is_empty());
        assert_eq!(updates.users().into_iter().collect::<Vec<_>>(), vec![alice, bob]);
    }

    #[tokio::test]
    async fn test_unknown_device_is_none() {
        let client = logged_in_client(None).await;
        let encryption = client.encryption();

        assert!(encryption.ed25519_key().is_some());
        assert!(encryption.curve25519_key().is_some());
        assert!(encryption.tracked_users().await.is_empty());

        let bob = user_id!("@bob:localhost");
        let device = encryption.get_device(bob, device_id!("BOBDEVICE")).await.unwrap();
        assert!(device.is_none());
        assert!(encryption.get_user_devices(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_need_a_session() {
        let client = crate::Client::builder()
            .homeserver_url("http://localhost:1234")
            .in_memory_store()
            .build()
            .await
            .unwrap();

        let result = client.encryption().upload_keys(None).await;
        assert_matches!(result, Err(Error::AuthenticationRequired));
        assert!(client.encryption().ed25519_key().is_none());
    }
}
