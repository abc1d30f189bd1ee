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

//! Module containing customized types modeling Matrix keys and events.
//!
//! These types were mostly taken from the Ruma project. The types differ in a
//! couple of important ways to the Ruma types of the same name:
//!
//! 1. They are using vodozemac types so we directly deserialize into a
//!    vodozemac Curve25519 or Ed25519 key.
//! 2. They support lossless serialization cycles in a canonical JSON supported
//!    way, meaning the white-space and field order won't be preserved but the
//!    data will, unknown fields land in an `other` map.
//! 3. Types containing secrets implement the [`Zeroize`] and
//!    [`ZeroizeOnDrop`] traits where the containing secret is zeroized.
//!
//! [`Zeroize`]: zeroize::Zeroize
//! [`ZeroizeOnDrop`]: zeroize::ZeroizeOnDrop

use std::{collections::BTreeMap, fmt};

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, KeyError};

pub mod events;

/// The identifier of the pairwise Olm algorithm.
pub const OLM_V1_CURVE25519_AES_SHA2: &str = "m.olm.v1.curve25519-aes-sha2";

/// An encryption algorithm to be used to encrypt messages sent to a room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// An algorithm we don't know how to handle, room settings may still
    /// carry it so the room is treated as encrypted.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The string identifier of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => OLM_V1_CURVE25519_AES_SHA2,
            Self::Unknown(algorithm) => algorithm,
        }
    }

    /// Is this an algorithm we can encrypt and decrypt with.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::OlmV1Curve25519AesSha2)
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            OLM_V1_CURVE25519_AES_SHA2 => Self::OlmV1Curve25519AesSha2,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let algorithm = String::deserialize(deserializer)?;
        Ok(algorithm.as_str().into())
    }
}

/// Signatures for a signed object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Signatures(Default::default())
    }

    /// Add the given signature from the given signer and the given key_id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: OwnedDeviceKeyId,
        signature: Ed25519Signature,
    ) -> Option<String> {
        self.0.entry(signer).or_default().insert(key_id, signature.to_base64())
    }

    /// Try to find an Ed25519 signature from the given signer with the given
    /// key id.
    pub fn get_signature(&self, signer: &UserId, key_id: &DeviceKeyId) -> Option<Ed25519Signature> {
        let signature = self.0.get(signer)?.get(key_id)?;
        Ed25519Signature::from_base64(signature).ok()
    }

    /// Do we hold any signatures.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Additional data added to device key information by intermediate servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name which the user set on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl UnsignedDeviceInfo {
    fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// Identity keys for a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The ID of the user the device belongs to.
    ///
    /// Must match the user ID used when logging in.
    pub user_id: OwnedUserId,

    /// The ID of the device these keys belong to.
    ///
    /// Must match the device ID used when logging in.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms supported by this device.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,

    /// Signatures for the device key object.
    pub signatures: Signatures,

    /// Additional data added to the device key information by intermediate
    /// servers, and not covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl DeviceKeys {
    /// Creates a new `DeviceKeys` from the given user id, device ID,
    /// algorithms, keys and signatures.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<OwnedDeviceKeyId, String>,
        signatures: Signatures,
    ) -> Self {
        Self {
            user_id,
            device_id,
            algorithms,
            keys,
            signatures,
            unsigned: Default::default(),
            other: BTreeMap::new(),
        }
    }

    /// Get the key of the given key algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys.get(&DeviceKeyId::from_parts(algorithm, &self.device_id)).map(String::as_str)
    }

    /// Get the Ed25519 key of the given device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }
}

/// A key for the SignedCurve25519 algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    /// The Curve25519 key that can be used to establish Olm sessions, base64
    /// encoded.
    key: String,

    /// Signatures for the key object.
    signatures: Signatures,

    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl SignedKey {
    /// Creates a new `SignedKey` with the given key and empty signatures.
    pub fn new(key: Curve25519PublicKey) -> Self {
        Self { key: key.to_base64(), signatures: Signatures::new(), other: BTreeMap::new() }
    }

    /// The actual Curve25519 key that can be used to establish Olm sessions.
    pub fn key(&self) -> Result<Curve25519PublicKey, KeyError> {
        Curve25519PublicKey::from_base64(&self.key)
    }

    /// The signatures of the JSON object.
    pub fn signatures(&self) -> &Signatures {
        &self.signatures
    }

    /// Mutable access to the signatures of the JSON object.
    pub fn signatures_mut(&mut self) -> &mut Signatures {
        &mut self.signatures
    }
}

/// A one-time public key handed out by the server for a `/keys/claim`
/// request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneTimeKey {
    /// A signed Curve25519 one-time key.
    SignedKey(SignedKey),
    /// An unsigned Curve25519 one-time key, we refuse to create sessions with
    /// these.
    Key(String),
}
