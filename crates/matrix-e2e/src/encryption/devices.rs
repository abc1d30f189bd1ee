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

use std::ops::Deref;

use matrix_e2e_crypto::{Device as BaseDevice, LocalTrust, UserDevices as BaseUserDevices};
use ruma::{DeviceId, OwnedDeviceId};
use tracing::info;

use super::CryptoEvent;
use crate::{Client, Result};

/// A device represents a E2EE capable client of an user.
#[derive(Clone, Debug)]
pub struct Device {
    pub(crate) inner: BaseDevice,
    pub(crate) client: Client,
}

impl Deref for Device {
    type Target = BaseDevice;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Device {
    pub(crate) fn new(inner: BaseDevice, client: Client) -> Self {
        Self { inner, client }
    }

    /// Mark the device as verified.
    ///
    /// Verification is local only, nothing is sent to the server.
    pub async fn verify(&self) -> Result<()> {
        self.set_local_trust(LocalTrust::Verified).await
    }

    /// Block the device, no more messages get encrypted for it.
    pub async fn block(&self) -> Result<()> {
        self.set_local_trust(LocalTrust::Blocked).await
    }

    /// Reset the trust state of the device, undoing a previous verification
    /// or block.
    pub async fn unverify(&self) -> Result<()> {
        self.set_local_trust(LocalTrust::Unverified).await
    }

    /// Set the local trust state of the device to the given state.
    ///
    /// The new state is persisted and announced as a
    /// [`CryptoEvent::DeviceTrustChanged`].
    ///
    /// # Arguments
    ///
    /// * `trust_state` - The new trust state that should be set for the device.
    pub async fn set_local_trust(&self, trust_state: LocalTrust) -> Result<()> {
        if self.local_trust_state() == trust_state {
            return Ok(());
        }

        self.inner.set_local_trust(trust_state).await?;

        info!(
            user_id = %self.user_id(),
            device_id = %self.device_id(),
            ?trust_state,
            "Changed the local trust state of a device"
        );

        self.client.encryption().send_crypto_event(CryptoEvent::DeviceTrustChanged {
            user_id: self.user_id().to_owned(),
            device_id: self.device_id().to_owned(),
            trust: trust_state,
        });

        Ok(())
    }
}

/// The collection of all the [`Device`]s a user has.
#[derive(Debug)]
pub struct UserDevices {
    pub(crate) inner: BaseUserDevices,
    pub(crate) client: Client,
}

impl UserDevices {
    pub(crate) fn new(inner: BaseUserDevices, client: Client) -> Self {
        Self { inner, client }
    }

    /// Get the specific device with the given device ID.
    pub fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.inner.get(device_id).map(|d| Device::new(d, self.client.clone()))
    }

    /// Iterator over all the device ids of the user devices.
    pub fn keys(&self) -> impl Iterator<Item = &OwnedDeviceId> {
        self.inner.keys()
    }

    /// Iterator over all the devices of the user devices.
    pub fn devices(&self) -> impl Iterator<Item = Device> + '_ {
        let client = self.client.clone();
        self.inner.devices().map(move |d| Device::new(d, client.clone()))
    }

    /// Does the user have any known devices.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
