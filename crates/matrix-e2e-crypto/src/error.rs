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

use ruma::{CanonicalJsonError, IdParseError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// A new Olm session couldn't be created.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// A signature on a device key or one-time key couldn't be created or
    /// verified.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The room isn't configured to use an algorithm we know how to encrypt
    /// with.
    #[error("the room {0} uses an encryption algorithm we don't support: {1}")]
    UnknownAlgorithm(OwnedRoomId, String),

    /// None of the sessions we share with the sender could decrypt the
    /// message and no new session could be created from it.
    #[error("no Olm session could decrypt the message from {0}")]
    BadEncryptedMessage(String),
}

/// Error that occurs when decrypting an event that is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The provided JSON value isn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The Encrypted message doesn't contain a ciphertext at all.
    #[error("the Encrypted message doesn't contain a ciphertext")]
    MissingCiphertext,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    NotIncludedInRecipients,

    /// The Encrypted message is missing the signing key of the sender.
    #[error("the Encrypted message is missing the signing key of the sender")]
    MissingSigningKey,

    /// The encrypted event doesn't have a valid sender.
    #[error("the Encrypted event is missing its sender")]
    MissingSender,

    /// The encrypted message is missing the sender key.
    #[error("the Encrypted message is missing the sender key")]
    MissingSenderKey,

    /// The ciphertext uses a message type we don't know about.
    #[error("the Olm message type {0} is unknown")]
    UnknownMessageType(usize),

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The plaintext was encrypted for somebody else.
    #[error("the plaintext was encrypted for {0} and not for us")]
    MismatchedRecipient(OwnedUserId),

    /// The public key that was part of the message doesn't match the key we
    /// have stored.
    #[error(
        "the public key that was part of the message doesn't match the key we \
        have stored, expected {0}, got {1}"
    )]
    MismatchedKeys(String, String),

    /// The room ID inside of the plaintext doesn't match the room the event
    /// was received in.
    #[error(
        "the room id of the plaintext doesn't match the room id of the \
        encrypted event: expected {0}, got {1}"
    )]
    MismatchedRoom(OwnedRoomId, OwnedRoomId),
}

/// Error type describing different errors that happen when we check or create
/// signatures for a Matrix JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The ID of the signing key isn't a valid key ID.
    #[error("the ID of the signing key is invalid")]
    InvalidKeyId(#[from] IdParseError),

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The user id or device id of the new keys differs from the ones of the
    /// device they should update.
    #[error("the user id or device id of the signed object doesn't match the device")]
    UserIdMismatch,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON object doesn't contain a signature from the expected
    /// key.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signing key that used to sign the object has been changed.
    #[error("the signing key that used to sign the object has changed, old: {0:?}, new: {1:?}")]
    SigningKeyChanged(Option<String>, Option<String>),

    /// The signed object couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] CanonicalJsonError),
}

/// Error that occurs when a new Olm session can't be created.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The server didn't hand out a one-time key for the device.
    #[error(
        "Tried to create a new Olm session for {0} {1}, but no one-time key \
        could be claimed"
    )]
    KeyClaimExhausted(OwnedUserId, OwnedDeviceId),

    /// The requested one-time key isn't a signed curve key.
    #[error(
        "Failed to create a new Olm session for {0} {1}, the requested \
        one-time key isn't a signed curve key"
    )]
    OneTimeKeyNotSigned(OwnedUserId, OwnedDeviceId),

    /// Failed to verify the one-time key signatures.
    #[error("Failed to verify the one-time key signatures for {0} {1}: {2}")]
    InvalidSignature(OwnedUserId, OwnedDeviceId, SignatureError),

    /// The user's device is missing a curve25519 key.
    #[error(
        "Tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// The given curve25519 key is not a valid key.
    #[error("The given curve25519 key is not a valid key")]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// The pre-key message didn't correspond to one of our unused one-time
    /// keys, or it was otherwise malformed.
    #[error(transparent)]
    InboundSessionError(#[from] vodozemac::olm::SessionCreationError),
}

/// Errors that can be returned by
/// [`crate::machine::OlmMachine::set_room_settings`].
#[derive(Debug, Error)]
pub enum SetRoomSettingsError {
    /// The changes are rejected because they conflict with the previous
    /// settings for this room.
    #[error("the new settings conflict with the existing encryption settings of the room")]
    EncryptionDowngrade,

    /// The changes are rejected because we would be unable to use them to
    /// encrypt events.
    #[error("the algorithm {0} isn't supported")]
    UnknownAlgorithm(String),

    /// The store ran into an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}
