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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`]
//!
//! An in-memory only store is provided as well as a SQLite based one,
//! depending on your needs and targets a custom store may be implemented,
//! e.g. for `wasm-unknown-unknown` an indexeddb store would be needed
//!
//! ```
//! # use std::sync::Arc;
//! # use matrix_e2e_crypto::{
//! #     OlmMachine,
//! #     store::{MemoryStore, PickleKey},
//! # };
//! # use ruma::{device_id, user_id};
//! # async fn example() -> anyhow::Result<()> {
//! # let user_id = user_id!("@example:localhost");
//! # let device_id = device_id!("TEST");
//! let store = Arc::new(MemoryStore::new());
//!
//! let machine = OlmMachine::with_store(user_id, device_id, store, PickleKey::new()).await?;
//! # Ok(()) }
//! ```
//!
//! [`OlmMachine`]: /matrix_e2e_crypto/struct.OlmMachine.html
//! [`CryptoStore`]: trait.Cryptostore.html

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use vodozemac::olm::IdentityKeys;

use crate::{
    identities::DeviceData,
    olm::{Account, PickledAccount, PickledSession, Session},
    types::EventEncryptionAlgorithm,
};

pub mod caches;
#[cfg(any(test, feature = "testing"))]
#[macro_use]
#[allow(missing_docs)]
pub mod integration_tests;
mod memorystore;
mod pickle_key;
mod traits;

use caches::{insert_sorted, DeviceStore, SessionStore};
pub use memorystore::MemoryStore;
pub use pickle_key::{InvalidPickleKeyLength, PickleKey};
pub use traits::{CryptoStore, DynCryptoStore, IntoCryptoStore};

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// The stored account belongs to a different user.
    #[error(
        "the account in the store doesn't match the account in the constructor: \
        expected {expected}, got {got}"
    )]
    MismatchedAccount {
        /// The expected user ID.
        expected: OwnedUserId,
        /// The user ID of the stored account.
        got: OwnedUserId,
    },

    /// An IO error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failed to decrypt a pickled object.
    #[error("An object failed to be decrypted while unpickling")]
    UnpicklingError(#[from] vodozemac::PickleError),

    /// Failed to serialize or deserialize a value.
    #[error(transparent)]
    Serialization(#[from] SerdeError),

    /// A problem with the underlying database backend
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `CryptoStoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `Result` alias where the error type is `CryptoStoreError`.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The encryption configuration of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// The members of the room at the time encryption was enabled.
    #[serde(default)]
    pub members: Vec<OwnedUserId>,
}

impl RoomSettings {
    /// Create settings for the pairwise Olm algorithm.
    pub fn olm(members: Vec<OwnedUserId>) -> Self {
        Self { algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2, members }
    }
}

/// Device changes that should be pushed to the crypto store.
#[derive(Clone, Debug, Default)]
pub struct DeviceChanges {
    /// The list of devices that appeared and need to be stored.
    pub new: Vec<DeviceData>,
    /// The list of changed devices that need to be stored.
    pub changed: Vec<DeviceData>,
    /// The list of deleted devices that need to be removed from the store.
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    /// Are there any changes stored in this struct.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// The users whose device lists changed.
    pub fn users(&self) -> BTreeSet<OwnedUserId> {
        self.new
            .iter()
            .chain(&self.changed)
            .chain(&self.deleted)
            .map(|d| d.user_id().to_owned())
            .collect()
    }
}

/// Load the account of the given device from the store.
pub(crate) async fn load_account(
    store: &DynCryptoStore,
    device_id: &DeviceId,
    pickle_key: &PickleKey,
) -> Result<Option<Account>> {
    let Some(pickle) = store.load_account(device_id).await? else { return Ok(None) };
    let pickle: PickledAccount = serde_json::from_str(&pickle)?;

    Ok(Some(Account::from_pickle(pickle, pickle_key)?))
}

/// Save the account to the store, replacing the previously stored one.
pub(crate) async fn save_account(
    store: &DynCryptoStore,
    account: &Account,
    pickle_key: &PickleKey,
) -> Result<()> {
    let pickle = serde_json::to_string(&account.pickle(pickle_key))?;
    store.save_account(account.device_id(), pickle).await
}

/// A wrapper for our CryptoStore trait object.
///
/// This is needed because we want to have a generic interface so we can
/// store/restore objects that we can serialize. Since trait objects and
/// generics don't mix let the CryptoStore store strings and this wrapper
/// adds the generic interface on top.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    identity_keys: IdentityKeys,
    pickle_key: PickleKey,
    store: Arc<DynCryptoStore>,
    sessions: SessionStore,
    devices: DeviceStore,
    /// Device maps are read-modify-write records, writes for them are
    /// serialized.
    devices_write_lock: Mutex<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .field("store", &self.inner.store)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub(crate) fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        identity_keys: IdentityKeys,
        pickle_key: PickleKey,
        store: Arc<DynCryptoStore>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                user_id,
                device_id,
                identity_keys,
                pickle_key,
                store,
                sessions: SessionStore::new(),
                devices: DeviceStore::new(),
                devices_write_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub(crate) fn identity_keys(&self) -> IdentityKeys {
        self.inner.identity_keys
    }

    pub(crate) fn inner(&self) -> &DynCryptoStore {
        &*self.inner.store
    }

    pub(crate) async fn save_account(&self, account: &Account) -> Result<()> {
        save_account(self.inner(), account, &self.inner.pickle_key).await
    }

    /// Get all the sessions that belong to the given sender key.
    ///
    /// Returns `None` if we never stored a session for the key.
    pub(crate) async fn get_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        if let Some(sessions) = self.inner.sessions.get(sender_key) {
            return Ok(Some(sessions));
        }

        let Some(pickles) = self.inner.store.get_sessions(sender_key).await? else {
            return Ok(None);
        };

        let pickles: BTreeMap<String, PickledSession> = serde_json::from_str(&pickles)?;
        let sessions = pickles
            .into_values()
            .map(|p| Session::from_pickle(p, &self.inner.pickle_key))
            .collect::<Result<Vec<_>, _>>()?;

        trace!(sender_key, count = sessions.len(), "Loaded Olm sessions from the store");

        Ok(Some(self.inner.sessions.set_for_sender(sender_key, sessions)))
    }

    /// Get the sessions of the given sender key, creating an empty entry in
    /// the cache if there are none so the per-peer lock can be taken before
    /// the first session gets created.
    pub(crate) async fn get_or_create_sessions(
        &self,
        sender_key: &str,
    ) -> Result<Arc<Mutex<Vec<Session>>>> {
        Ok(match self.get_sessions(sender_key).await? {
            Some(sessions) => sessions,
            None => self.inner.sessions.set_for_sender(sender_key, Vec::new()),
        })
    }

    /// Persist the given list of sessions, the caller needs to hold the lock
    /// for the list.
    pub(crate) async fn save_sessions(&self, sender_key: &str, sessions: &[Session]) -> Result<()> {
        let mut pickles = BTreeMap::new();

        for session in sessions {
            let pickle = session.pickle(&self.inner.pickle_key).await;
            pickles.insert(session.session_id().to_owned(), pickle);
        }

        self.inner.store.save_sessions(sender_key, serde_json::to_string(&pickles)?).await
    }

    /// Add a new session to the locked list of sessions and persist the list.
    pub(crate) async fn add_session(
        &self,
        sessions: &mut Vec<Session>,
        session: Session,
    ) -> Result<()> {
        let sender_key = session.sender_key().to_base64();
        let session_id = session.session_id().to_owned();

        if insert_sorted(sessions, session) {
            debug!(sender_key, session_id, "Storing a new Olm session");
        }

        self.save_sessions(&sender_key, sessions).await
    }

    async fn load_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>> {
        if let Some(devices) = self.inner.devices.user_devices(user_id) {
            return Ok(devices);
        }

        let devices = match self.inner.store.get_user_devices(user_id).await? {
            Some(devices) => serde_json::from_str(&devices)?,
            None => BTreeMap::new(),
        };

        Ok(self.inner.devices.load_user_devices(user_id, devices))
    }

    /// Get the device of the given user with the given device id.
    pub(crate) async fn get_device_data(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        if let Some(device) = self.inner.devices.get(user_id, device_id) {
            return Ok(Some(device));
        }

        Ok(self.load_user_devices(user_id).await?.remove(device_id))
    }

    /// Get all the devices of the given user.
    pub(crate) async fn get_user_devices_data(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>> {
        self.load_user_devices(user_id).await
    }

    /// Store new or updated devices.
    pub(crate) async fn save_devices(&self, devices: Vec<DeviceData>) -> Result<()> {
        self.save_device_changes(DeviceChanges { changed: devices, ..Default::default() }).await
    }

    /// Persist a set of device changes, the device map of every affected user
    /// is replaced as a whole.
    pub(crate) async fn save_device_changes(&self, changes: DeviceChanges) -> Result<()> {
        let _guard = self.inner.devices_write_lock.lock().await;

        let mut per_user: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>> =
            BTreeMap::new();

        for user_id in changes.users() {
            let devices = self.load_user_devices(&user_id).await?;
            per_user.insert(user_id, devices);
        }

        for device in changes.new.into_iter().chain(changes.changed) {
            if let Some(devices) = per_user.get_mut(device.user_id()) {
                devices.insert(device.device_id().to_owned(), device);
            }
        }

        for device in changes.deleted {
            if let Some(devices) = per_user.get_mut(device.user_id()) {
                devices.remove(device.device_id());
            }
        }

        for (user_id, devices) in per_user {
            self.inner.store.save_user_devices(&user_id, serde_json::to_string(&devices)?).await?;
            self.inner.devices.set_user_devices(&user_id, devices);
        }

        Ok(())
    }

    pub(crate) async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>> {
        Ok(match self.inner.store.get_room_settings(room_id).await? {
            Some(settings) => Some(serde_json::from_str(&settings)?),
            None => None,
        })
    }

    pub(crate) async fn save_room_settings(
        &self,
        room_id: &RoomId,
        settings: &RoomSettings,
    ) -> Result<()> {
        self.inner.store.save_room_settings(room_id, serde_json::to_string(settings)?).await
    }

    pub(crate) async fn remove_room_settings(&self, room_id: &RoomId) -> Result<()> {
        self.inner.store.remove_room_settings(room_id).await
    }

    pub(crate) async fn load_tracked_users(&self) -> Result<BTreeMap<OwnedUserId, bool>> {
        Ok(match self.inner.store.load_tracked_users().await? {
            Some(users) => serde_json::from_str(&users)?,
            None => BTreeMap::new(),
        })
    }

    pub(crate) async fn save_tracked_users(
        &self,
        users: &BTreeMap<OwnedUserId, bool>,
    ) -> Result<()> {
        self.inner.store.save_tracked_users(serde_json::to_string(users)?).await
    }
}
