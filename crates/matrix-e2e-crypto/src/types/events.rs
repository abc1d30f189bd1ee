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

//! Event content types of `m.room.encrypted` events using the pairwise Olm
//! algorithm and the plaintext payload that gets encrypted.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::olm::OlmMessage;

use super::EventEncryptionAlgorithm;
use crate::error::EventError;

/// An Olm ciphertext for a single recipient device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// The Olm message type, `0` for pre-key messages and `1` for normal
    /// messages.
    #[serde(rename = "type")]
    pub message_type: usize,
    /// The base64 encoded ciphertext.
    pub body: String,
}

impl OlmCiphertext {
    /// Convert this ciphertext into a vodozemac `OlmMessage`.
    pub fn to_olm_message(&self) -> Result<OlmMessage, EventError> {
        OlmMessage::from_parts(self.message_type, &self.body)
            .map_err(|_| EventError::UnknownMessageType(self.message_type))
    }
}

impl From<OlmMessage> for OlmCiphertext {
    fn from(message: OlmMessage) -> Self {
        let (message_type, body) = message.to_parts();
        Self { message_type, body }
    }
}

/// The content of an `m.room.encrypted` event encrypted with
/// `m.olm.v1.curve25519-aes-sha2`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The Curve25519 key of the sender.
    pub sender_key: String,
    /// Ciphertexts keyed by the Curve25519 key of the recipient device.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

impl OlmV1Curve25519AesSha2Content {
    /// Create an empty content for the given sender key.
    pub fn new(sender_key: String) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            sender_key,
            ciphertext: BTreeMap::new(),
        }
    }
}

/// A leniently parsed `m.room.encrypted` content as received from the server.
///
/// Every field is optional, the decryption state machine decides how a
/// missing field is reported.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ReceivedEncryptedContent {
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub sender_key: Option<String>,
    #[serde(default)]
    pub ciphertext: Option<BTreeMap<String, OlmCiphertext>>,
}

/// The signing keys that are part of the plaintext payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadKeys {
    /// The base64 encoded Ed25519 key.
    pub ed25519: String,
}

/// The plaintext of an Olm encrypted room event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptedOlmPayload {
    /// The type of the wrapped event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the wrapped event.
    pub content: Value,
    /// The room the event was sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The device that encrypted the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,
    /// The signing keys of the sender device.
    pub keys: PayloadKeys,
    /// The user the ciphertext was meant for.
    pub recipient: OwnedUserId,
    /// The signing keys of the recipient device.
    pub recipient_keys: PayloadKeys,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::{OlmV1Curve25519AesSha2Content, ReceivedEncryptedContent};
    use crate::types::EventEncryptionAlgorithm;

    #[test]
    fn test_content_serialization() {
        let json = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": "Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw",
            "ciphertext": {
                "hHQEyJ9eMAUC8sLtHcMgMiEeVYvOrY2fJoD3ZjEmtyw": {
                    "type": 0,
                    "body": "Awogc5L3QuIyvkluB1O/UAJp0",
                },
            },
        });

        let content: OlmV1Curve25519AesSha2Content = serde_json::from_value(json.clone()).unwrap();

        assert_eq!(content.algorithm, EventEncryptionAlgorithm::OlmV1Curve25519AesSha2);
        assert_eq!(content.ciphertext.len(), 1);
        assert_eq!(serde_json::to_value(content).unwrap(), json);
    }

    #[test]
    fn test_lenient_parsing_of_partial_content() {
        let content: ReceivedEncryptedContent =
            serde_json::from_value(json!({ "algorithm": "m.megolm.v1.aes-sha2" })).unwrap();

        assert_matches!(content.algorithm.as_deref(), Some("m.megolm.v1.aes-sha2"));
        assert!(content.ciphertext.is_none());
        assert!(content.sender_key.is_none());
    }
}
