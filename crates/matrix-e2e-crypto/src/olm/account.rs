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
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OneTimeKeyAlgorithm, OneTimeKeyId, OwnedDeviceId,
    OwnedOneTimeKeyId, OwnedUserId, SecondsSinceUnixEpoch, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519Signature, KeyId, PickleError,
};

use super::{utility::canonical_json_for_signing, Session};
use crate::{
    error::{SessionCreationError, SignatureError},
    identities::DeviceData,
    store::PickleKey,
    types::{DeviceKeys, EventEncryptionAlgorithm, OneTimeKey, Signatures, SignedKey},
};

/// The result of creating an Olm session from a pre-key message.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message.
    pub plaintext: String,
}

/// Account holding identity keys for which sessions can be created.
///
/// An account is the central identity for encrypted communication between two
/// devices.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    identity_keys: Arc<IdentityKeys>,
    /// `vodozemac` account.
    inner: Box<InnerAccount>,
    /// Is this account ready to encrypt messages? (i.e. has it shared keys
    /// with a homeserver)
    shared: bool,
    /// The number of signed one-time keys we have uploaded to the server.
    uploaded_signed_key_count: u64,
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to
/// restore an account. The vodozemac pickle is encrypted with the pickle key.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The encrypted pickle of the Olm account.
    pub pickle: String,
    /// Was the account shared.
    pub shared: bool,
    /// The number of uploaded one-time keys we have on the server.
    pub uploaded_signed_key_count: u64,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared())
            .finish()
    }
}

pub type OneTimeKeys = BTreeMap<OwnedOneTimeKeyId, SignedKey>;

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    ///
    /// No one-time keys are created, the pool is filled once we learn how
    /// many keys the server holds for us.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            identity_keys: Arc::new(identity_keys),
            inner: Box::new(account),
            shared: false,
            uploaded_signed_key_count: 0,
        }
    }

    /// The user ID of the account owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device ID of the account owner.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public parts of the identity keys for the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.identity_keys
    }

    /// Update the uploaded key count.
    pub fn update_uploaded_key_count(&mut self, new_count: u64) {
        self.uploaded_signed_key_count = new_count;
    }

    /// Get the currently known uploaded key count.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_signed_key_count
    }

    /// Has the account been shared with the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Get the one-time keys of the account that haven't been published yet.
    pub fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    /// Generate count number of one-time keys, returns the number of keys
    /// that were created.
    pub fn generate_one_time_keys(&mut self, count: usize) -> usize {
        let result = self.inner.generate_one_time_keys(count);

        if !result.removed.is_empty() {
            debug!(
                removed = result.removed.len(),
                "Generating one-time keys discarded some of the oldest unpublished keys"
            );
        }

        result.created.len()
    }

    /// Get the maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Mark the current set of one-time keys as being published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    ///
    /// Returns the signature as a base64 encoded string.
    pub fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.sign(string)
    }

    /// Convert a JSON value to the canonical representation and sign the
    /// JSON string.
    ///
    /// The `signatures` and `unsigned` fields are not part of the signed
    /// data.
    pub fn sign_json(&self, json: &Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical_json = canonical_json_for_signing(json)?;
        Ok(self.sign(&canonical_json))
    }

    fn signing_key_id(&self) -> ruma::OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// Get the unsigned device keys of the account.
    pub fn unsigned_device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();

        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
                identity_keys.curve25519.to_base64(),
            ),
            (self.signing_key_id(), identity_keys.ed25519.to_base64()),
        ]);

        DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            vec![EventEncryptionAlgorithm::OlmV1Curve25519AesSha2],
            keys,
            Signatures::new(),
        )
    }

    /// Sign the device keys of the account and return them so they can be
    /// uploaded.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = self.unsigned_device_keys();

        let json = serde_json::to_value(&device_keys).map_err(|_| SignatureError::NotAnObject)?;
        let signature = self.sign_json(&json)?;

        device_keys.signatures.add_signature(
            self.user_id.clone(),
            self.signing_key_id(),
            signature,
        );

        Ok(device_keys)
    }

    /// Sign and prepare one-time keys to be uploaded.
    ///
    /// If no one-time keys need to be uploaded, returns an empty `BTreeMap`.
    pub fn signed_one_time_keys(&self) -> Result<OneTimeKeys, SignatureError> {
        let mut keys_map = BTreeMap::new();

        for (key_id, key) in self.one_time_keys() {
            let signed_key = self.sign_key(key)?;

            keys_map.insert(
                OneTimeKeyId::from_parts(
                    OneTimeKeyAlgorithm::SignedCurve25519,
                    key_id.to_base64().as_str().into(),
                ),
                signed_key,
            );
        }

        Ok(keys_map)
    }

    fn sign_key(&self, key: Curve25519PublicKey) -> Result<SignedKey, SignatureError> {
        let mut key = SignedKey::new(key);

        let json = serde_json::to_value(&key).map_err(|_| SignatureError::NotAnObject)?;
        let signature = self.sign_json(&json)?;

        key.signatures_mut().add_signature(self.user_id.clone(), self.signing_key_id(), signature);

        Ok(key)
    }

    /// Create a new session with another account given a one-time key.
    ///
    /// # Arguments
    ///
    /// * `identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `one_time_key` - A signed one-time key that the other account
    ///   created and shared with us.
    pub fn create_outbound_session_helper(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create a new session with another account given a one-time key and a
    /// device.
    ///
    /// Returns the newly created session or a `SessionCreationError` if
    /// creating a session failed.
    ///
    /// # Arguments
    /// * `device` - The other account's device.
    ///
    /// * `key_map` - A map from the algorithm and device ID to the one-time
    ///   key that the other account created and shared with us.
    #[instrument(
        skip_all,
        fields(user_id = ?device.user_id(), device_id = ?device.device_id())
    )]
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        key_map: &BTreeMap<OwnedOneTimeKeyId, OneTimeKey>,
    ) -> Result<Session, SessionCreationError> {
        let (_, one_time_key) = key_map.iter().next().ok_or_else(|| {
            SessionCreationError::KeyClaimExhausted(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let OneTimeKey::SignedKey(one_time_key) = one_time_key else {
            return Err(SessionCreationError::OneTimeKeyNotSigned(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            ));
        };

        device.verify_one_time_key(one_time_key).map_err(|e| {
            SessionCreationError::InvalidSignature(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                e,
            )
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let one_time_key = one_time_key.key()?;

        trace!("Creating a new outbound Olm session");

        Ok(self.create_outbound_session_helper(identity_key, one_time_key))
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// The one-time key the message was created with is removed from the
    /// account, so a second session can never be created from it.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us by the other
    ///   account.
    #[instrument(skip_all, fields(session_id = ?message.session_id()))]
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        trace!("Creating a new Olm session from a pre-key message");

        let result = self.inner.create_inbound_session(their_identity_key, message)?;
        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        debug!(session_id, "Decrypted an Olm message from a new Olm session");

        let session = Session {
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Get a serializable version of the account, the vodozemac pickle gets
    /// encrypted with the given pickle key.
    pub fn pickle(&self, pickle_key: &PickleKey) -> PickledAccount {
        let pickle: AccountPickle = self.inner.pickle();

        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: pickle.encrypt(pickle_key.key()),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_signed_key_count,
        }
    }

    /// Restore an account from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `pickle` - The pickled version of the Account.
    ///
    /// * `pickle_key` - The key that was used to encrypt the pickle.
    pub fn from_pickle(
        pickle: PickledAccount,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let account_pickle = AccountPickle::from_encrypted(&pickle.pickle, pickle_key.key())?;
        let account = InnerAccount::from_pickle(account_pickle);
        let identity_keys = account.identity_keys();

        Ok(Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            identity_keys: Arc::new(identity_keys),
            inner: Box::new(account),
            shared: pickle.shared,
            uploaded_signed_key_count: pickle.uploaded_signed_key_count,
        })
    }
}
