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

use std::{collections::BTreeMap, ops::Deref, sync::Arc};

use matrix_e2e_common::{
    deserialized_responses::{DeviceLinkProblem, VerificationLevel, VerificationState},
    locks::RwLock,
};
use ruma::{DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    olm::{utility::verify_json, Account},
    store::{Result as StoreResult, Store},
    types::{DeviceKeys, EventEncryptionAlgorithm, SignedKey},
};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The trust state is unset, the device is neither verified nor blocked.
    #[default]
    Unverified,
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blocked from communicating, no messages get encrypted
    /// for it.
    Blocked,
}

/// A read-only version of a `Device`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceData {
    device_keys: Arc<DeviceKeys>,
    trust_state: Arc<RwLock<LocalTrust>>,
}

impl DeviceData {
    /// Create a new Device, this constructor skips signature verification of
    /// the keys, `TryFrom` should be used for completely new devices we
    /// receive.
    pub fn new(device_keys: DeviceKeys, trust_state: LocalTrust) -> Self {
        Self { device_keys: device_keys.into(), trust_state: Arc::new(RwLock::new(trust_state)) }
    }

    /// Create a `DeviceData` from a signed JSON object, checking the
    /// self-signature over the exact object we received.
    pub fn from_signed_json(json: &Value) -> Result<Self, SignatureError> {
        let device_keys: DeviceKeys =
            serde_json::from_value(json.clone()).map_err(|_| SignatureError::NotAnObject)?;
        check_self_signature(&device_keys, json)?;

        Ok(Self::new(device_keys, LocalTrust::Unverified))
    }

    /// Create a `DeviceData` describing the device of the given account.
    pub fn from_account(account: &Account) -> Result<Self, SignatureError> {
        Ok(Self::new(account.device_keys()?, LocalTrust::Verified))
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.device_keys.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_keys.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.device_keys.unsigned.device_display_name.as_deref()
    }

    /// Get the key of the given key algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.device_keys.get_key(algorithm)
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.device_keys.curve25519_key()
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.device_keys.ed25519_key()
    }

    /// Get a map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<ruma::OwnedDeviceKeyId, String> {
        &self.device_keys.keys
    }

    /// Get the list of algorithms this device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.device_keys.algorithms
    }

    /// Return the device keys
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        *self.trust_state.read()
    }

    /// Is the device locally marked as trusted.
    pub fn is_verified(&self) -> bool {
        self.local_trust_state() == LocalTrust::Verified
    }

    /// Is the device locally marked as blocked.
    ///
    /// Blocked devices won't receive any encrypted messages.
    pub fn is_blocked(&self) -> bool {
        self.local_trust_state() == LocalTrust::Blocked
    }

    /// The verification state events sent by this device get.
    pub fn verification_state(&self) -> VerificationState {
        match self.local_trust_state() {
            LocalTrust::Verified => VerificationState::Verified,
            LocalTrust::Blocked => VerificationState::Unverified(VerificationLevel::BlockedDevice),
            LocalTrust::Unverified => {
                VerificationState::Unverified(VerificationLevel::UnverifiedDevice)
            }
        }
    }

    /// Set the trust state of the device to the given state.
    ///
    /// Note: This should only done in the crypto store where the trust state
    /// can be stored.
    pub(crate) fn set_trust_state(&self, state: LocalTrust) {
        *self.trust_state.write() = state;
    }

    /// Update a device with a new device keys struct.
    ///
    /// Returns `true` if the device keys changed, an error if the new keys
    /// aren't for this device or if the signing key changed.
    pub(crate) fn update_device(&mut self, new: &DeviceData) -> Result<bool, SignatureError> {
        if self.user_id() != new.user_id() || self.device_id() != new.device_id() {
            Err(SignatureError::UserIdMismatch)
        } else if self.ed25519_key() != new.ed25519_key() {
            Err(SignatureError::SigningKeyChanged(
                self.ed25519_key().map(|k| k.to_base64()),
                new.ed25519_key().map(|k| k.to_base64()),
            ))
        } else if self.device_keys != new.device_keys {
            trace!(
                user_id = ?self.user_id(),
                device_id = ?self.device_id(),
                keys = ?self.keys(),
                "Updated a device",
            );

            self.device_keys = new.device_keys.clone();

            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedKey,
    ) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, self.device_id());
        let json = serde_json::to_value(one_time_key).map_err(|_| SignatureError::NotAnObject)?;

        verify_json(self.user_id(), &key_id, &signing_key, &json)
    }
}

fn check_self_signature(device_keys: &DeviceKeys, json: &Value) -> Result<(), SignatureError> {
    let signing_key = device_keys.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;
    let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_keys.device_id);

    verify_json(&device_keys.user_id, &key_id, &signing_key, json)
}

impl PartialEq for DeviceData {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}

/// A device represents a E2EE capable client of an user.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: DeviceData,
    pub(crate) store: Store,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("device", &self.inner).finish()
    }
}

impl Deref for Device {
    type Target = DeviceData;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Device {
    /// Set the local trust state of the device to the given state and
    /// persist it.
    ///
    /// # Arguments
    ///
    /// * `trust_state` - The new trust state that should be set for the
    ///   device.
    pub async fn set_local_trust(&self, trust_state: LocalTrust) -> StoreResult<()> {
        self.inner.set_trust_state(trust_state);
        self.store.save_devices(vec![self.inner.clone()]).await
    }

    /// Is this device our own device.
    pub fn is_own_device(&self) -> bool {
        self.user_id() == self.store.user_id() && self.device_id() == self.store.device_id()
    }

    /// Do we share at least one Olm session with this device.
    pub async fn has_olm_session(&self) -> StoreResult<bool> {
        let Some(key) = self.curve25519_key() else { return Ok(false) };
        Ok(match self.store.get_sessions(&key.to_base64()).await? {
            Some(sessions) => !sessions.lock().await.is_empty(),
            None => false,
        })
    }
}

/// A read only view over all devices belonging to a user.
#[derive(Debug)]
pub struct UserDevices {
    pub(crate) inner: BTreeMap<OwnedDeviceId, DeviceData>,
    pub(crate) store: Store,
}

impl UserDevices {
    /// Get the specific device with the given device ID.
    pub fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.get(device_id).map(|d| Device { inner: d.clone(), store: self.store.clone() })
    }

    /// Iterator over all the device ids of the user devices.
    pub fn keys(&self) -> impl Iterator<Item = &OwnedDeviceId> {
        self.inner.keys()
    }

    /// Iterator over all the devices of the user devices.
    pub fn devices(&self) -> impl Iterator<Item = Device> + '_ {
        self.inner.values().map(|d| Device { inner: d.clone(), store: self.store.clone() })
    }

    /// Does the user have any known devices.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// The verification state of a sender we couldn't link to a known device.
pub(crate) fn missing_device_state() -> VerificationState {
    VerificationState::Unverified(VerificationLevel::None(DeviceLinkProblem::MissingDevice))
}

/// Testing Facilities for Device Management
#[cfg(any(test, feature = "testing"))]
#[allow(dead_code)]
pub(crate) mod testing {
    use serde_json::{json, Value};

    use super::DeviceData;

    /// Signed device keys of `@example:localhost`.
    pub fn device_keys_json() -> Value {
        json!({
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "device_id": "BNYQQWUMXO",
            "user_id": "@example:localhost",
            "keys": {
                "curve25519:BNYQQWUMXO": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
                "ed25519:BNYQQWUMXO": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:BNYQQWUMXO": "kTwMrbsLJJM/uFGOj/oqlCaRuw7i9p/6eGrTlXjo8UJMCFAetoyWzoMcF35vSe4S6FTx8RJmqX6rM7ep53MHDQ"
                }
            },
            "unsigned": {
                "device_display_name": "Alice's mobile phone"
            }
        })
    }

    /// Generate default DeviceData for tests
    pub fn get_device() -> DeviceData {
        DeviceData::from_signed_json(&device_keys_json()).expect("Test device keys are signed")
    }
}
