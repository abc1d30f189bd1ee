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

//! Request and response bodies of the key management endpoints.
//!
//! The [`OlmMachine`](crate::OlmMachine) produces the requests and consumes
//! the responses, sending them is left to the caller.

use std::{collections::BTreeMap, time::Duration};

use ruma::{OneTimeKeyAlgorithm, OwnedDeviceId, OwnedOneTimeKeyId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeviceKeys, OneTimeKey, SignedKey};

/// The body of a `POST /keys/upload` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Our signed device keys, only present if they weren't yet uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Signed one-time keys that should be published.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<OwnedOneTimeKeyId, SignedKey>,
}

impl KeysUploadRequest {
    /// Is this request only going to fetch the one-time key counts.
    pub fn is_empty(&self) -> bool {
        self.device_keys.is_none() && self.one_time_keys.is_empty()
    }
}

/// The body of a `/keys/upload` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// The number of unclaimed one-time keys the server holds for us, per
    /// algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<OneTimeKeyAlgorithm, u64>,
}

impl KeysUploadResponse {
    /// The number of unclaimed signed Curve25519 one-time keys.
    pub fn signed_curve25519_count(&self) -> u64 {
        self.one_time_key_counts.get(&OneTimeKeyAlgorithm::SignedCurve25519).copied().unwrap_or(0)
    }
}

/// The body of a `POST /keys/query` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose devices should be downloaded, an empty list means all
    /// devices of the user.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    /// The time in milliseconds the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl KeysQueryRequest {
    pub(crate) fn new(users: impl IntoIterator<Item = OwnedUserId>) -> Self {
        Self {
            device_keys: users.into_iter().map(|u| (u, Vec::new())).collect(),
            timeout: Some(Duration::from_secs(10).as_millis() as u64),
        }
    }
}

/// The body of a `/keys/query` response.
///
/// Device keys are kept as raw JSON so signatures can be checked over the
/// exact object the server returned.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
    /// The device keys of the queried users.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

/// The body of a `POST /keys/claim` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The devices whose one-time keys should be claimed, with the algorithm
    /// of the key.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, OneTimeKeyAlgorithm>>,
    /// The time in milliseconds the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl KeysClaimRequest {
    /// Create a request claiming a signed Curve25519 key for every given
    /// device.
    pub fn new(devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>) -> Self {
        let one_time_keys = devices
            .into_iter()
            .map(|(user_id, devices)| {
                let devices = devices
                    .into_iter()
                    .map(|d| (d, OneTimeKeyAlgorithm::SignedCurve25519))
                    .collect();
                (user_id, devices)
            })
            .collect();

        Self { one_time_keys, timeout: Some(Duration::from_secs(10).as_millis() as u64) }
    }

    /// Is there any device we want a key for.
    pub fn is_empty(&self) -> bool {
        self.one_time_keys.values().all(BTreeMap::is_empty)
    }
}

/// The body of a `/keys/claim` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// Servers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
    /// The claimed one-time keys.
    #[serde(default)]
    pub one_time_keys:
        BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<OwnedOneTimeKeyId, OneTimeKey>>>,
}

/// The outcome of a one-time key claim, devices we couldn't establish a
/// session with are reported instead of failing the whole batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeysClaimOutcome {
    /// Devices we now share a new Olm session with, with the new session id.
    pub created: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
    /// Devices for which no key was returned or no session could be created.
    pub missing_devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}
