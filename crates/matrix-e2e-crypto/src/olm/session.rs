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

use std::{fmt, sync::Arc};

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{field::debug, instrument, trace, Span};
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

use crate::store::PickleKey;

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    /// The OlmSession
    pub inner: Arc<Mutex<InnerSession>>,
    /// Our sessionId
    pub session_id: Arc<str>,
    /// The Key of the sender
    pub sender_key: Curve25519PublicKey,
    /// When the session was created
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a `DecryptionError` if decryption
    /// failed.
    ///
    /// # Arguments
    ///
    /// * `message` - The Olm message that should be decrypted.
    #[instrument(skip_all, fields(session))]
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let mut inner = self.inner.lock().await;
        let plaintext = inner.decrypt(message)?;

        Span::current().record("session", debug(&*inner));
        trace!("Decrypted a Olm message");

        let plaintext = String::from_utf8_lossy(&plaintext).to_string();

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Encrypt the given plaintext as a OlmMessage.
    ///
    /// # Arguments
    ///
    /// * `plaintext` - The plaintext that should be encrypted.
    pub async fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        let mut session = self.inner.lock().await;
        let message = session.encrypt(plaintext);

        self.last_use_time = SecondsSinceUnixEpoch::now();
        message
    }

    /// Does the given pre-key message belong to the handshake that created
    /// this session.
    pub fn matches_inbound(&self, message: &OlmMessage) -> bool {
        match message {
            OlmMessage::PreKey(m) => m.session_id() == self.session_id(),
            OlmMessage::Normal(_) => false,
        }
    }

    /// Get the sender key that was used to establish this Session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store the session as an encrypted pickle.
    ///
    /// # Arguments
    ///
    /// * `pickle_key` - The key the vodozemac pickle gets encrypted with.
    pub async fn pickle(&self, pickle_key: &PickleKey) -> PickledSession {
        let pickle: SessionPickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle: pickle.encrypt(pickle_key.key()),
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a Session from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `pickle` - The pickled version of the `Session`.
    ///
    /// * `pickle_key` - The key that was used to encrypt the pickle.
    pub fn from_pickle(
        pickle: PickledSession,
        pickle_key: &PickleKey,
    ) -> Result<Self, PickleError> {
        let session_pickle = SessionPickle::from_encrypted(&pickle.pickle, pickle_key.key())?;
        let session = InnerSession::from_pickle(session_pickle);
        let session_id = session.session_id();

        Ok(Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to
/// restore a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The encrypted pickle of the Olm Session.
    pub pickle: String,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: Curve25519PublicKey,
    /// The Unix timestamp when the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The Unix timestamp when the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(test)]
mod tests {
    use vodozemac::olm::OlmMessage;

    use super::Session;
    use crate::{olm::tests::get_account_and_session, store::PickleKey};

    #[tokio::test]
    async fn test_roundtrip_over_established_session() {
        let (alice, mut bob, mut alice_session) = get_account_and_session();

        let message = alice_session.encrypt("first").await;
        let OlmMessage::PreKey(prekey) = &message else { panic!("Expected a pre-key message") };

        let result = bob.create_inbound_session(alice.identity_keys().curve25519, prekey).unwrap();
        let mut bob_session = result.session;
        assert!(bob_session.matches_inbound(&message));

        let reply = bob_session.encrypt("second").await;
        assert_eq!(alice_session.decrypt(&reply).await.unwrap(), "second");

        let message = alice_session.encrypt("third").await;
        assert!(!bob_session.matches_inbound(&message));
        assert_eq!(bob_session.decrypt(&message).await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_pickled_session_keeps_ratchet_state() {
        let pickle_key = PickleKey::new();
        let (alice, mut bob, mut alice_session) = get_account_and_session();

        let message = alice_session.encrypt("hello").await;
        let OlmMessage::PreKey(prekey) = &message else { panic!("Expected a pre-key message") };
        let mut bob_session =
            bob.create_inbound_session(alice.identity_keys().curve25519, prekey).unwrap().session;

        let pickle = alice_session.pickle(&pickle_key).await;
        let mut restored = Session::from_pickle(pickle, &pickle_key).unwrap();

        assert_eq!(restored, alice_session);
        assert_eq!(restored.sender_key(), alice_session.sender_key());

        let message = restored.encrypt("after restore").await;
        assert_eq!(bob_session.decrypt(&message).await.unwrap(), "after restore");
    }
}
