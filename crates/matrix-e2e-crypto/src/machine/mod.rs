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
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use matrix_e2e_common::deserialized_responses::{
    AlgorithmInfo, EncryptionInfo, SyncTimelineEvent, UnableToDecryptReason,
};
use ruma::{
    DeviceId, DeviceKeyAlgorithm, OwnedDeviceId, OwnedOneTimeKeyId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::{
    olm::{IdentityKeys, OlmMessage, PreKeyMessage},
    Curve25519PublicKey,
};

use crate::{
    error::{EventError, OlmError, OlmResult, SessionCreationError, SetRoomSettingsError},
    identities::{
        device::missing_device_state, Device, DeviceData, IdentityManager, UserDevices,
    },
    olm::{Account, Session},
    requests::{
        KeysClaimOutcome, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
    },
    session_manager::SessionManager,
    store::{
        self, load_account, CryptoStoreError, DeviceChanges, IntoCryptoStore, MemoryStore,
        PickleKey, Result as StoreResult, RoomSettings, Store,
    },
    types::{
        events::{
            DecryptedOlmPayload, OlmCiphertext, OlmV1Curve25519AesSha2Content, PayloadKeys,
            ReceivedEncryptedContent,
        },
        EventEncryptionAlgorithm, OneTimeKey,
    },
};

/// State machine implementation of the pairwise Olm encryption protocol used
/// for Matrix end to end encryption of room events.
#[derive(Clone)]
pub struct OlmMachine {
    pub(crate) inner: Arc<OlmMachineInner>,
}

pub(crate) struct OlmMachineInner {
    /// The unique user id that owns this account.
    user_id: OwnedUserId,
    /// The unique device ID of the device that holds this account.
    device_id: OwnedDeviceId,
    /// The public identity keys of our account, they never change.
    identity_keys: IdentityKeys,
    /// Our account, holding the private identity keys and the one-time key
    /// pool.
    account: Arc<Mutex<Account>>,
    /// Store for the encryption keys.
    /// Persists all the encryption keys so a client can resume the session
    /// without the need to create new keys.
    store: Store,
    /// A state machine that handles Olm sessions creation.
    session_manager: SessionManager,
    /// State machine handling public user identities and devices, keeping track
    /// of when a key query needs to be done and handling one.
    identity_manager: IdentityManager,
    /// An upper bound for the one-time key pool, `0` means the capacity of the
    /// account is used.
    one_time_key_pool_size: AtomicUsize,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a new memory based OlmMachine.
    ///
    /// The created machine will keep the encryption keys only in memory and
    /// once the object is dropped the keys will be lost.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = Account::new(user_id, device_id);
        let store = Store::new(
            user_id.to_owned(),
            device_id.to_owned(),
            account.identity_keys(),
            PickleKey::new(),
            MemoryStore::new().into_crypto_store(),
        );

        Self::new_helper(account, store, BTreeMap::new())
    }

    fn new_helper(
        account: Account,
        store: Store,
        tracked_users: BTreeMap<OwnedUserId, bool>,
    ) -> Self {
        let identity_keys = account.identity_keys();
        let user_id = account.user_id().to_owned();
        let device_id = account.device_id().to_owned();
        let account = Arc::new(Mutex::new(account));

        let session_manager = SessionManager::new(account.clone(), store.clone());
        let identity_manager = IdentityManager::new(store.clone(), tracked_users);

        let inner = Arc::new(OlmMachineInner {
            user_id,
            device_id,
            identity_keys,
            account,
            store,
            session_manager,
            identity_manager,
            one_time_key_pool_size: AtomicUsize::new(0),
        });

        Self { inner }
    }

    /// Create a new OlmMachine with the given [`CryptoStore`].
    ///
    /// The created machine will keep the encryption keys in the given store,
    /// if the store already holds an account for the device it is restored
    /// with the given pickle key, otherwise a new account is created and
    /// persisted.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `store` - A `CryptoStore` implementation that will be used to store
    ///   the encryption keys.
    ///
    /// * `pickle_key` - The key the account and sessions are encrypted with
    ///   before they reach the store.
    ///
    /// [`CryptoStore`]: crate::store::CryptoStore
    #[instrument(skip(store, pickle_key), fields(ed25519_key, curve25519_key))]
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: impl IntoCryptoStore,
        pickle_key: PickleKey,
    ) -> StoreResult<Self> {
        let store = store.into_crypto_store();

        let account = match load_account(&*store, device_id, &pickle_key).await? {
            Some(account) => {
                if user_id != account.user_id() || device_id != account.device_id() {
                    return Err(CryptoStoreError::MismatchedAccount {
                        expected: user_id.to_owned(),
                        got: account.user_id().to_owned(),
                    });
                }

                debug!("Restored an Olm account");
                account
            }
            None => {
                let account = Account::new(user_id, device_id);
                store::save_account(&*store, &account, &pickle_key).await?;

                debug!("Created a new Olm account");
                account
            }
        };

        let identity_keys = account.identity_keys();
        tracing::Span::current()
            .record("ed25519_key", identity_keys.ed25519.to_base64())
            .record("curve25519_key", identity_keys.curve25519.to_base64());

        let store = Store::new(
            user_id.to_owned(),
            device_id.to_owned(),
            identity_keys,
            pickle_key,
            store,
        );
        let tracked_users = store.load_tracked_users().await?;

        Ok(Self::new_helper(account, store, tracked_users))
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The unique device ID that identifies this `OlmMachine`.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.inner.identity_keys
    }

    async fn save_account(&self, account: &Account) -> StoreResult<()> {
        self.inner.store.save_account(account).await
    }

    /// Lower the maximum number of one-time keys we keep published.
    ///
    /// A size of `0` or a size above the capacity of the account resets the
    /// pool to the capacity of the account.
    pub fn set_one_time_key_pool_size(&self, size: usize) {
        self.inner.one_time_key_pool_size.store(size, Ordering::SeqCst);
    }

    /// The maximum number of one-time keys we keep published on the server.
    pub async fn max_one_time_keys(&self) -> usize {
        let capacity = self.inner.account.lock().await.max_one_time_keys();

        match self.inner.one_time_key_pool_size.load(Ordering::SeqCst) {
            0 => capacity,
            size => size.min(capacity),
        }
    }

    /// The published key count below which the one-time key pool gets
    /// refilled, half of the pool maximum.
    pub async fn one_time_key_threshold(&self) -> u64 {
        (self.max_one_time_keys().await / 2) as u64
    }

    /// The number of one-time keys that were generated but not yet published.
    pub async fn one_time_keys(&self) -> usize {
        self.inner.account.lock().await.one_time_keys().len()
    }

    /// Have our device keys been uploaded to the server.
    pub async fn is_shared(&self) -> bool {
        self.inner.account.lock().await.shared()
    }

    /// The last known number of one-time keys the server holds for us.
    pub async fn uploaded_key_count(&self) -> u64 {
        self.inner.account.lock().await.uploaded_key_count()
    }

    /// Update the known server side one-time key count, as reported by a sync
    /// response.
    pub async fn update_one_time_key_count(&self, count: u64) -> StoreResult<()> {
        let mut account = self.inner.account.lock().await;

        if account.uploaded_key_count() != count {
            trace!(count, "Updating the one-time key count");
            account.update_uploaded_key_count(count);
            self.save_account(&account).await?;
        }

        Ok(())
    }

    /// Should device or one-time keys be uploaded to the server.
    pub async fn should_upload_keys(&self) -> bool {
        let threshold = self.one_time_key_threshold().await;
        let account = self.inner.account.lock().await;

        !account.shared() || account.uploaded_key_count() < threshold
    }

    /// Get a `/keys/upload` request for our signed device keys.
    ///
    /// Returns `None` if the device keys were already uploaded.
    pub async fn device_keys_upload_request(&self) -> OlmResult<Option<KeysUploadRequest>> {
        let account = self.inner.account.lock().await;

        if account.shared() {
            Ok(None)
        } else {
            Ok(Some(KeysUploadRequest {
                device_keys: Some(account.device_keys()?),
                ..Default::default()
            }))
        }
    }

    /// Get a `/keys/upload` request that refills the server side one-time key
    /// pool.
    ///
    /// Keys are generated until the server holds as many keys as the
    /// threshold, keys that were generated before but never published count
    /// towards the new keys. Returns `None` if the server holds enough keys.
    ///
    /// # Arguments
    ///
    /// * `server_count` - The number of one-time keys the server holds for
    ///   us.
    ///
    /// * `max_keys` - An upper bound for the number of keys in the request.
    #[instrument(skip(self))]
    pub async fn one_time_keys_upload_request(
        &self,
        server_count: u64,
        max_keys: Option<usize>,
    ) -> OlmResult<Option<KeysUploadRequest>> {
        let threshold = self.one_time_key_threshold().await;

        if server_count >= threshold {
            trace!(threshold, "The server holds enough one-time keys");
            return Ok(None);
        }

        let mut needed = (threshold - server_count) as usize;
        if let Some(max_keys) = max_keys {
            needed = needed.min(max_keys);
        }

        if needed == 0 {
            return Ok(None);
        }

        let mut account = self.inner.account.lock().await;
        let pending = account.one_time_keys().len();

        if pending < needed {
            let created = account.generate_one_time_keys(needed - pending);
            debug!(created, pending, "Generated new one-time keys");
            self.save_account(&account).await?;
        }

        let one_time_keys = account.signed_one_time_keys()?;

        Ok(Some(KeysUploadRequest { device_keys: None, one_time_keys }))
    }

    /// Receive a successful `/keys/upload` response.
    ///
    /// Marks the uploaded keys as published and returns the number of one-time
    /// keys the server now holds for us.
    ///
    /// # Arguments
    ///
    /// * `request` - The request that was sent to the server.
    ///
    /// * `response` - The response of the server.
    pub async fn receive_keys_upload_response(
        &self,
        request: &KeysUploadRequest,
        response: &KeysUploadResponse,
    ) -> OlmResult<u64> {
        let mut account = self.inner.account.lock().await;

        if request.device_keys.is_some() && !account.shared() {
            info!("Marking the device keys as uploaded");
            account.mark_as_shared();
        }

        if !request.one_time_keys.is_empty() {
            account.mark_keys_as_published();
        }

        let count = response.signed_curve25519_count();
        debug!(count, "Updated the uploaded one-time key count");
        account.update_uploaded_key_count(count);

        self.save_account(&account).await?;

        Ok(count)
    }

    /// Start tracking the device lists of the given users.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<()> {
        self.inner.identity_manager.update_tracked_users(users).await
    }

    /// The users whose device lists we track.
    pub async fn tracked_users(&self) -> Vec<OwnedUserId> {
        self.inner.identity_manager.tracked_users().await
    }

    /// Handle the `device_lists` section of a sync response.
    ///
    /// # Arguments
    ///
    /// * `changed` - Users whose device lists changed, tracked ones get
    ///   queried again.
    ///
    /// * `left` - Users we don't share an encrypted room with anymore.
    pub async fn receive_device_list_changes(
        &self,
        changed: &[OwnedUserId],
        left: &[OwnedUserId],
    ) -> StoreResult<()> {
        self.inner.identity_manager.mark_users_as_changed(changed.iter().map(AsRef::as_ref)).await?;
        self.inner.identity_manager.stop_tracking(left.iter().map(AsRef::as_ref)).await
    }

    /// Get a `/keys/query` request for the tracked users whose device lists
    /// are outdated.
    pub async fn users_for_key_query(&self) -> Option<KeysQueryRequest> {
        self.inner.identity_manager.users_for_key_query().await
    }

    /// Build a `/keys/query` request for the given users, even if their
    /// device lists are up to date.
    pub fn build_key_query_for_users<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
    ) -> KeysQueryRequest {
        self.inner.identity_manager.build_key_query_for_users(users)
    }

    /// Receive a successful `/keys/query` response.
    ///
    /// Returns the device changes the response caused.
    pub async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> OlmResult<DeviceChanges> {
        Ok(self.inner.identity_manager.receive_keys_query_response(response).await?)
    }

    /// Get a specific device of a user.
    ///
    /// Returns a `Device` if one is found and the crypto store didn't throw
    /// an error.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<Device>> {
        Ok(self
            .inner
            .store
            .get_device_data(user_id, device_id)
            .await?
            .map(|inner| Device { inner, store: self.inner.store.clone() }))
    }

    /// Get all the known devices of a user.
    pub async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<UserDevices> {
        let inner = self.inner.store.get_user_devices_data(user_id).await?;
        Ok(UserDevices { inner, store: self.inner.store.clone() })
    }

    /// Get a `/keys/claim` request for the devices of the given users we
    /// don't share an Olm session with.
    ///
    /// Returns `None` if every device of the users already has a session.
    pub async fn get_missing_sessions(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> StoreResult<Option<KeysClaimRequest>> {
        self.inner.session_manager.keys_claim_request(users).await
    }

    /// Receive a successful `/keys/claim` response and create outbound Olm
    /// sessions from the claimed one-time keys.
    pub async fn receive_keys_claim_response(
        &self,
        request: &KeysClaimRequest,
        response: &KeysClaimResponse,
    ) -> OlmResult<KeysClaimOutcome> {
        self.inner.session_manager.receive_keys_claim_response(request, response).await
    }

    /// Create an outbound Olm session with the given device from a claimed
    /// one-time key.
    ///
    /// Existing sessions with the device stay valid. Returns the id of the
    /// new session.
    pub async fn create_outbound_session(
        &self,
        device: &DeviceData,
        key_map: &BTreeMap<OwnedOneTimeKeyId, OneTimeKey>,
    ) -> OlmResult<String> {
        let session = self.inner.account.lock().await.create_outbound_session(device, key_map)?;
        let session_id = session.session_id().to_owned();

        let sender_key = session.sender_key().to_base64();
        let sessions = self.inner.store.get_or_create_sessions(&sender_key).await?;
        let mut sessions = sessions.lock().await;
        self.inner.store.add_session(&mut sessions, session).await?;

        Ok(session_id)
    }

    /// Create an inbound Olm session from a pre-key message.
    ///
    /// The one-time key the message was encrypted with is consumed. Returns
    /// the id of the new session and the decrypted plaintext.
    pub async fn create_inbound_session(
        &self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> OlmResult<(String, String)> {
        let sessions = self.inner.store.get_or_create_sessions(&sender_key.to_base64()).await?;
        let mut sessions = sessions.lock().await;

        self.create_inbound_session_helper(&mut sessions, sender_key, message).await
    }

    /// The caller needs to hold the lock of the session list for the sender
    /// key.
    async fn create_inbound_session_helper(
        &self,
        sessions: &mut Vec<Session>,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> OlmResult<(String, String)> {
        let result = {
            let mut account = self.inner.account.lock().await;
            let result = account.create_inbound_session(sender_key, message)?;

            // The one-time key is gone from the account, persist that before
            // anything else.
            self.save_account(&account).await?;
            result
        };

        let session_id = result.session.session_id().to_owned();
        self.inner.store.add_session(sessions, result.session).await?;

        Ok((session_id, result.plaintext))
    }

    /// Encrypt an event for a single device.
    ///
    /// The session with the lowest session id is used. Returns `None` if we
    /// don't share a session with the device.
    ///
    /// # Arguments
    ///
    /// * `device` - The device the event should be encrypted for.
    ///
    /// * `event_type` - The type of the event.
    ///
    /// * `content` - The content of the event.
    ///
    /// * `room_id` - The room the event is sent to, if any.
    #[instrument(
        skip_all,
        fields(user_id = ?device.user_id(), device_id = ?device.device_id())
    )]
    pub async fn encrypt(
        &self,
        device: &DeviceData,
        event_type: &str,
        content: &Value,
        room_id: Option<&RoomId>,
    ) -> OlmResult<Option<OlmCiphertext>> {
        let (Some(sender_key), Some(recipient_key)) =
            (device.curve25519_key(), device.ed25519_key())
        else {
            warn!("Not encrypting for a device with missing identity keys");
            return Ok(None);
        };

        let Some(sessions) = self.inner.store.get_sessions(&sender_key.to_base64()).await? else {
            trace!("No Olm session found for the device");
            return Ok(None);
        };

        let mut sessions = sessions.lock().await;

        let Some(session) = sessions.first_mut() else {
            trace!("No Olm session found for the device");
            return Ok(None);
        };

        let payload = DecryptedOlmPayload {
            event_type: event_type.to_owned(),
            content: content.clone(),
            room_id: room_id.map(ToOwned::to_owned),
            sender: self.user_id().to_owned(),
            sender_device: Some(self.device_id().to_owned()),
            keys: PayloadKeys { ed25519: self.identity_keys().ed25519.to_base64() },
            recipient: device.user_id().to_owned(),
            recipient_keys: PayloadKeys { ed25519: recipient_key.to_base64() },
        };

        let plaintext = serde_json::to_string(&payload)?;
        let message = session.encrypt(&plaintext).await;

        trace!(session_id = session.session_id(), "Encrypted an event with an Olm session");

        self.inner.store.save_sessions(&sender_key.to_base64(), &sessions).await?;

        Ok(Some(message.into()))
    }

    /// Encrypt a room event for every device of the given room members.
    ///
    /// Our own device and blocked devices are skipped, devices we don't share
    /// a session with are left out of the ciphertext map.
    ///
    /// # Arguments
    ///
    /// * `room_id` - The room the event is sent to.
    ///
    /// * `event_type` - The type of the event.
    ///
    /// * `content` - The plaintext content of the event.
    ///
    /// * `members` - The members of the room.
    #[instrument(skip(self, content, members))]
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        if let Some(settings) = self.room_settings(room_id).await? {
            if !settings.algorithm.is_supported() {
                return Err(OlmError::UnknownAlgorithm(
                    room_id.to_owned(),
                    settings.algorithm.to_string(),
                ));
            }
        }

        let mut content_map =
            OlmV1Curve25519AesSha2Content::new(self.identity_keys().curve25519.to_base64());

        for user_id in members {
            let devices = self.inner.store.get_user_devices_data(user_id).await?;

            for (device_id, device) in devices {
                let is_own_device =
                    user_id == self.user_id() && <OwnedDeviceId as AsRef<DeviceId>>::as_ref(&device_id) == self.device_id();

                if is_own_device || device.is_blocked() {
                    continue;
                }

                let Some(recipient_key) = device.curve25519_key() else { continue };

                let ciphertext = self.encrypt(&device, event_type, content, Some(room_id)).await?;

                if let Some(ciphertext) = ciphertext {
                    content_map.ciphertext.insert(recipient_key.to_base64(), ciphertext);
                }
            }
        }

        debug!(recipients = content_map.ciphertext.len(), "Encrypted a room event");

        Ok(content_map)
    }

    /// Try every known session of the sender, and if that fails create a new
    /// inbound session from a pre-key message.
    async fn decrypt_olm_message(
        &self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<(String, String)> {
        let sender_key_base64 = sender_key.to_base64();
        let sessions = self.inner.store.get_or_create_sessions(&sender_key_base64).await?;
        let mut sessions = sessions.lock().await;

        let mut matches_inbound = false;
        let mut decrypted = None;

        for session in sessions.iter_mut() {
            match session.decrypt(message).await {
                Ok(plaintext) => {
                    decrypted = Some((session.session_id().to_owned(), plaintext));
                    break;
                }
                Err(e) => {
                    matches_inbound |= session.matches_inbound(message);

                    warn!(
                        sender_key = sender_key_base64,
                        session_id = session.session_id(),
                        error = ?e,
                        "Failed to decrypt an Olm message with a known session",
                    );
                }
            }
        }

        if let Some(decrypted) = decrypted {
            self.inner.store.save_sessions(&sender_key_base64, &sessions).await?;
            return Ok(decrypted);
        }

        match message {
            OlmMessage::PreKey(prekey) if !matches_inbound => {
                self.create_inbound_session_helper(&mut sessions, sender_key, prekey).await
            }
            _ => {
                warn!(
                    sender_key = sender_key_base64,
                    matches_inbound, "None of the known sessions could decrypt the Olm message",
                );

                Err(OlmError::BadEncryptedMessage(sender_key_base64))
            }
        }
    }

    /// Find the device that sent us a message, first by the device id the
    /// sender claims and then by the Curve25519 key.
    async fn find_sender_device(
        &self,
        sender: &UserId,
        sender_device: Option<&DeviceId>,
        sender_key: Curve25519PublicKey,
    ) -> StoreResult<Option<DeviceData>> {
        if let Some(device_id) = sender_device {
            if let Some(device) = self.inner.store.get_device_data(sender, device_id).await? {
                if device.curve25519_key() == Some(sender_key) {
                    return Ok(Some(device));
                }
            }
        }

        Ok(self
            .inner
            .store
            .get_user_devices_data(sender)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == Some(sender_key)))
    }

    async fn decrypt_room_event_helper(
        &self,
        event: &Value,
        room_id: &RoomId,
    ) -> OlmResult<SyncTimelineEvent> {
        let sender: OwnedUserId = event
            .get("sender")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .ok_or(EventError::MissingSender)?;

        let content: ReceivedEncryptedContent = match event.get("content") {
            Some(content) => serde_json::from_value(content.clone())?,
            None => return Err(EventError::NotAnObject.into()),
        };

        let algorithm = content.algorithm.as_deref().map(EventEncryptionAlgorithm::from);
        if !algorithm.is_some_and(|a| a.is_supported()) {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let ciphertext = content.ciphertext.ok_or(EventError::MissingCiphertext)?;

        let own_key = self.identity_keys().curve25519.to_base64();
        let ciphertext =
            ciphertext.get(&own_key).ok_or(EventError::NotIncludedInRecipients)?;

        let sender_key = content.sender_key.ok_or(EventError::MissingSenderKey)?;
        let sender_key = Curve25519PublicKey::from_base64(&sender_key)
            .map_err(SessionCreationError::from)?;

        let message = ciphertext.to_olm_message()?;
        let (session_id, plaintext) = self.decrypt_olm_message(sender_key, &message).await?;

        let payload: DecryptedOlmPayload = serde_json::from_str(&plaintext)?;

        if payload.sender != sender {
            return Err(EventError::MismatchedSender(payload.sender, sender).into());
        }

        if payload.recipient != self.user_id() {
            return Err(EventError::MismatchedRecipient(payload.recipient).into());
        }

        let own_signing_key = self.identity_keys().ed25519.to_base64();
        if payload.recipient_keys.ed25519 != own_signing_key {
            return Err(
                EventError::MismatchedKeys(own_signing_key, payload.recipient_keys.ed25519).into()
            );
        }

        if let Some(payload_room_id) = &payload.room_id {
            if payload_room_id != room_id {
                return Err(
                    EventError::MismatchedRoom(room_id.to_owned(), payload_room_id.clone()).into()
                );
            }
        }

        let device = self
            .find_sender_device(&sender, payload.sender_device.as_deref(), sender_key)
            .await?;

        let (sender_device, verification_state) = match &device {
            Some(device) => {
                let device_key = device.ed25519_key().map(|k| k.to_base64());

                if device_key.as_deref() != Some(payload.keys.ed25519.as_str()) {
                    return Err(EventError::MismatchedKeys(
                        device_key.unwrap_or_default(),
                        payload.keys.ed25519,
                    )
                    .into());
                }

                (Some(device.device_id().to_owned()), device.verification_state())
            }
            None => (payload.sender_device.clone(), missing_device_state()),
        };

        let encryption_info = EncryptionInfo {
            sender,
            sender_device,
            session_id,
            algorithm_info: AlgorithmInfo::OlmV1Curve25519AesSha2 {
                curve25519_key: sender_key.to_base64(),
                sender_claimed_keys: BTreeMap::from([(
                    DeviceKeyAlgorithm::Ed25519,
                    payload.keys.ed25519.clone(),
                )]),
            },
            verification_state,
        };

        let mut decrypted = event.clone();
        if let Some(object) = decrypted.as_object_mut() {
            object.insert("type".to_owned(), payload.event_type.into());
            object.insert("content".to_owned(), payload.content);
        }

        Ok(SyncTimelineEvent::decrypted(decrypted, encryption_info))
    }

    /// Decrypt an `m.room.encrypted` event.
    ///
    /// Cryptographic failures never result in an error, the event gets
    /// replaced with an `m.bad.encrypted` message carrying the reason.
    /// Errors are only returned if the crypto store fails.
    ///
    /// # Arguments
    ///
    /// * `event` - The encrypted event that should be decrypted.
    ///
    /// * `room_id` - The ID of the room the event was received in.
    #[instrument(skip_all, fields(?room_id, event_id))]
    pub async fn decrypt_room_event(
        &self,
        event: &Value,
        room_id: &RoomId,
    ) -> OlmResult<SyncTimelineEvent> {
        if let Some(event_id) = event.get("event_id").and_then(Value::as_str) {
            tracing::Span::current().record("event_id", event_id);
        }

        match self.decrypt_room_event_helper(event, room_id).await {
            Ok(event) => Ok(event),
            Err(OlmError::Store(e)) => Err(OlmError::Store(e)),
            Err(e) => {
                let reason = unable_to_decrypt_reason(&e);
                warn!(error = ?e, %reason, "Failed to decrypt a room event");

                Ok(SyncTimelineEvent::new_utd_event(event, reason))
            }
        }
    }

    /// Store the encryption settings of a room.
    ///
    /// Settings are only ever set once. Setting the same algorithm again is a
    /// no-op, a different algorithm is rejected. Unknown algorithms are
    /// accepted so the room is still treated as encrypted.
    pub async fn set_room_settings(
        &self,
        room_id: &RoomId,
        new_settings: &RoomSettings,
    ) -> Result<(), SetRoomSettingsError> {
        match self.inner.store.get_room_settings(room_id).await? {
            Some(old_settings) if old_settings.algorithm == new_settings.algorithm => {
                trace!(?room_id, "The room already uses the given encryption settings");
                Ok(())
            }
            Some(old_settings) => {
                warn!(
                    ?room_id,
                    old_algorithm = %old_settings.algorithm,
                    new_algorithm = %new_settings.algorithm,
                    "Rejecting conflicting room encryption settings",
                );

                Err(SetRoomSettingsError::EncryptionDowngrade)
            }
            None => {
                info!(
                    ?room_id,
                    algorithm = %new_settings.algorithm,
                    "Storing room encryption settings"
                );
                self.inner.store.save_room_settings(room_id, new_settings).await?;
                Ok(())
            }
        }
    }

    /// Enable encryption for a room with settings chosen by us.
    ///
    /// Unlike [`OlmMachine::set_room_settings`] only algorithms we support
    /// are accepted.
    pub async fn enable_room_encryption(
        &self,
        room_id: &RoomId,
        settings: &RoomSettings,
    ) -> Result<(), SetRoomSettingsError> {
        if !settings.algorithm.is_supported() {
            return Err(SetRoomSettingsError::UnknownAlgorithm(settings.algorithm.to_string()));
        }

        self.set_room_settings(room_id, settings).await
    }

    /// Get the encryption settings of a room.
    pub async fn room_settings(&self, room_id: &RoomId) -> StoreResult<Option<RoomSettings>> {
        self.inner.store.get_room_settings(room_id).await
    }

    /// Forget the encryption settings of a room, later messages are sent in
    /// the clear.
    pub async fn remove_room_settings(&self, room_id: &RoomId) -> StoreResult<()> {
        info!(?room_id, "Removing room encryption settings");
        self.inner.store.remove_room_settings(room_id).await
    }

    /// Does the room have encryption settings.
    pub async fn is_room_encrypted(&self, room_id: &RoomId) -> StoreResult<bool> {
        Ok(self.room_settings(room_id).await?.is_some())
    }
}

fn unable_to_decrypt_reason(error: &OlmError) -> UnableToDecryptReason {
    match error {
        OlmError::EventError(EventError::UnsupportedAlgorithm) => {
            UnableToDecryptReason::EncryptionNotEnabled
        }
        OlmError::EventError(EventError::MissingCiphertext) => {
            UnableToDecryptReason::MissingCiphertext
        }
        OlmError::EventError(EventError::NotIncludedInRecipients) => {
            UnableToDecryptReason::NotIncludedInRecipients
        }
        _ => UnableToDecryptReason::BadEncryptedMessage,
    }
}
