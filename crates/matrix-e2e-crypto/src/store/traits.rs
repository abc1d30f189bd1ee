// Copyright 2022 The Matrix.org Foundation C.I.C.
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
use ruma::{DeviceId, RoomId, UserId};

use super::Result;

/// Represents a store that the `OlmMachine` uses to store E2EE data (such as
/// cryptographic keys).
///
/// Every value is an opaque serialized blob, only the `OlmMachine` knows how
/// to interpret them. Saving a value replaces the previous record as a whole.
#[async_trait]
pub trait CryptoStore: AsyncTraitDeps {
    /// Load the pickled account of the given device.
    async fn load_account(&self, device_id: &DeviceId) -> Result<Option<String>>;

    /// Save the pickled account of the given device.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The device the account belongs to.
    ///
    /// * `account` - The pickled account.
    async fn save_account(&self, device_id: &DeviceId, account: String) -> Result<()>;

    /// Get the pickled sessions we share with the device owning the given
    /// Curve25519 key.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The sender key that was used to establish the
    ///   sessions.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<String>>;

    /// Replace the pickled sessions we share with the device owning the given
    /// Curve25519 key.
    async fn save_sessions(&self, sender_key: &str, sessions: String) -> Result<()>;

    /// Get the serialized device map of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<Option<String>>;

    /// Replace the serialized device map of the given user.
    async fn save_user_devices(&self, user_id: &UserId, devices: String) -> Result<()>;

    /// Get the serialized encryption settings of the given room.
    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<String>>;

    /// Replace the serialized encryption settings of the given room.
    async fn save_room_settings(&self, room_id: &RoomId, settings: String) -> Result<()>;

    /// Remove the encryption settings of the given room.
    async fn remove_room_settings(&self, room_id: &RoomId) -> Result<()>;

    /// Load the serialized set of users whose device lists we track.
    async fn load_tracked_users(&self) -> Result<Option<String>>;

    /// Replace the serialized set of users whose device lists we track.
    async fn save_tracked_users(&self, users: String) -> Result<()>;
}

/// A type-erased [`CryptoStore`].
pub type DynCryptoStore = dyn CryptoStore;

/// A type that can be type-erased into `Arc<DynCryptoStore>`.
///
/// This trait is not meant to be implemented directly outside
/// `matrix-e2e-crypto`, but it is automatically implemented for everything
/// that implements `CryptoStore`.
pub trait IntoCryptoStore {
    #[doc(hidden)]
    fn into_crypto_store(self) -> Arc<DynCryptoStore>;
}

impl<T> IntoCryptoStore for T
where
    T: CryptoStore + 'static,
{
    fn into_crypto_store(self) -> Arc<DynCryptoStore> {
        Arc::new(self)
    }
}

impl<T> IntoCryptoStore for Arc<T>
where
    T: CryptoStore + 'static,
{
    fn into_crypto_store(self) -> Arc<DynCryptoStore> {
        self
    }
}

impl IntoCryptoStore for Arc<DynCryptoStore> {
    fn into_crypto_store(self) -> Arc<DynCryptoStore> {
        self
    }
}
