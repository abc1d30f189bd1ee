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

use std::{collections::BTreeMap, fmt};

use ruma::{DeviceKeyAlgorithm, OwnedDeviceId, OwnedEventId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// The message type used for events that replace an undecryptable event in
/// the timeline.
pub const BAD_ENCRYPTED_MSGTYPE: &str = "m.bad.encrypted";

/// The verification state of the device that sent an event to us.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum VerificationState {
    /// The event was sent by a device that we have locally marked as verified.
    Verified,
    /// The event could not be linked to a verified device. The reason is
    /// supplied as a struct member.
    Unverified(VerificationLevel),
}

/// The partial verification level we were able to achieve for a received
/// event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum VerificationLevel {
    /// The sending device is known but wasn't verified.
    UnverifiedDevice,
    /// The sending device is known and was blocked by us.
    BlockedDevice,
    /// We weren't able to link the message back to any device.
    None(DeviceLinkProblem),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum DeviceLinkProblem {
    /// The device is missing, either because it was deleted, or you haven't
    /// yet downloaded it.
    MissingDevice,
}

/// The algorithm specific information of a decrypted event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum AlgorithmInfo {
    /// The info if the event was encrypted using m.olm.v1.curve25519-aes-sha2
    OlmV1Curve25519AesSha2 {
        /// The curve25519 key of the device that encrypted the event.
        curve25519_key: String,
        /// The signing keys the sender claimed to own inside of the encrypted
        /// payload.
        sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    },
}

/// Struct containing information on how an event was decrypted.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EncryptionInfo {
    /// The user ID of the event sender, note this is untrusted data unless the
    /// `verification_state` is `Verified` as well.
    pub sender: OwnedUserId,
    /// The device ID of the device that sent us the event, note this is
    /// untrusted data unless `verification_state` is `Verified` as well.
    pub sender_device: Option<OwnedDeviceId>,
    /// The ID of the Olm session that decrypted the event.
    pub session_id: String,
    /// Information about the algorithm that was used to encrypt the event.
    pub algorithm_info: AlgorithmInfo,
    /// The verification state of the device that sent us the event at the
    /// time of decryption.
    pub verification_state: VerificationState,
}

/// The reason why an encrypted event couldn't be decrypted.
///
/// The `Display` implementation yields the human readable reason that ends up
/// in the body of the `m.bad.encrypted` replacement event.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum UnableToDecryptReason {
    /// We don't support the algorithm of the event, or encryption support is
    /// turned off for this client.
    EncryptionNotEnabled,
    /// The event content didn't contain a ciphertext at all.
    MissingCiphertext,
    /// The event was encrypted, but not for our device.
    NotIncludedInRecipients,
    /// None of our sessions could decrypt the event and no new session could
    /// be created for it.
    BadEncryptedMessage,
}

impl UnableToDecryptReason {
    /// The human readable reason as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EncryptionNotEnabled => "Encryption not enabled",
            Self::MissingCiphertext => "Missing ciphertext",
            Self::NotIncludedInRecipients => "Not included in recipients",
            Self::BadEncryptedMessage => "Bad Encrypted Message",
        }
    }
}

impl fmt::Display for UnableToDecryptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the event that ended up in the timeline came to be.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TimelineEventKind {
    /// The event was sent in the clear.
    PlainText,
    /// The event was encrypted and we decrypted it.
    Decrypted(EncryptionInfo),
    /// The event was encrypted and couldn't be decrypted; the event is an
    /// `m.bad.encrypted` replacement.
    UnableToDecrypt {
        /// Why the decryption failed.
        reason: UnableToDecryptReason,
    },
}

/// A room event coming from a sync or from a `/messages` response, after
/// decryption took place.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncTimelineEvent {
    /// The actual event, decrypted if it was encrypted.
    pub event: JsonValue,
    /// The decryption outcome of the event.
    pub kind: TimelineEventKind,
}

impl SyncTimelineEvent {
    /// Create a new event that was received in the clear.
    pub fn new(event: JsonValue) -> Self {
        Self { event, kind: TimelineEventKind::PlainText }
    }

    /// Create a new event that was successfully decrypted.
    pub fn decrypted(event: JsonValue, encryption_info: EncryptionInfo) -> Self {
        Self { event, kind: TimelineEventKind::Decrypted(encryption_info) }
    }

    /// Replace an undecryptable event with an `m.bad.encrypted` message.
    ///
    /// The replacement keeps the event ID, sender and timestamp of the
    /// original event, the original content is preserved under the `content`
    /// key of the new content.
    pub fn new_utd_event(original: &JsonValue, reason: UnableToDecryptReason) -> Self {
        let mut event = json!({
            "type": "m.room.message",
            "content": {
                "msgtype": BAD_ENCRYPTED_MSGTYPE,
                "body": reason.as_str(),
                "content": original.get("content").cloned().unwrap_or(JsonValue::Null),
            },
        });

        if let (Some(object), Some(original)) = (event.as_object_mut(), original.as_object()) {
            for field in ["event_id", "sender", "origin_server_ts", "room_id", "unsigned"] {
                if let Some(value) = original.get(field) {
                    object.insert(field.to_owned(), value.clone());
                }
            }
        }

        Self { event, kind: TimelineEventKind::UnableToDecrypt { reason } }
    }

    /// Get the event id of this event if the event has any valid id.
    pub fn event_id(&self) -> Option<OwnedEventId> {
        self.event.get("event_id").and_then(|id| serde_json::from_value(id.clone()).ok())
    }

    /// Get the type of the event.
    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(JsonValue::as_str)
    }

    /// Get the sender of the event.
    pub fn sender(&self) -> Option<OwnedUserId> {
        self.event.get("sender").and_then(|s| serde_json::from_value(s.clone()).ok())
    }

    /// Get the content of the event.
    pub fn content(&self) -> Option<&JsonValue> {
        self.event.get("content")
    }

    /// Get the state key of the event if it's a state event.
    pub fn state_key(&self) -> Option<&str> {
        self.event.get("state_key").and_then(JsonValue::as_str)
    }

    /// The encryption info of the event, `None` if the event wasn't encrypted
    /// or couldn't be decrypted.
    pub fn encryption_info(&self) -> Option<&EncryptionInfo> {
        match &self.kind {
            TimelineEventKind::Decrypted(info) => Some(info),
            _ => None,
        }
    }

    /// Is this an `m.bad.encrypted` replacement event.
    pub fn is_utd(&self) -> bool {
        matches!(self.kind, TimelineEventKind::UnableToDecrypt { .. })
    }
}

#[cfg(test)]
mod tests {
    use ruma::event_id;
    use serde_json::json;

    use super::{SyncTimelineEvent, UnableToDecryptReason, BAD_ENCRYPTED_MSGTYPE};

    #[test]
    fn test_utd_event_keeps_identity_of_original() {
        let original = json!({
            "type": "m.room.encrypted",
            "event_id": "$xxxxx:example.org",
            "sender": "@carl:example.com",
            "origin_server_ts": 2189,
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": "foo",
            },
        });

        let event =
            SyncTimelineEvent::new_utd_event(&original, UnableToDecryptReason::MissingCiphertext);

        assert!(event.is_utd());
        assert_eq!(event.event_id().as_deref(), Some(event_id!("$xxxxx:example.org")));
        assert_eq!(event.event_type(), Some("m.room.message"));
        assert_eq!(event.event["origin_server_ts"], 2189);

        let content = event.content().unwrap();
        assert_eq!(content["msgtype"], BAD_ENCRYPTED_MSGTYPE);
        assert_eq!(content["body"], "Missing ciphertext");
        assert_eq!(content["content"]["sender_key"], "foo");
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(UnableToDecryptReason::EncryptionNotEnabled.to_string(), "Encryption not enabled");
        assert_eq!(
            UnableToDecryptReason::NotIncludedInRecipients.to_string(),
            "Not included in recipients"
        );
        assert_eq!(UnableToDecryptReason::BadEncryptedMessage.to_string(), "Bad Encrypted Message");
    }
}
