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

//! Error conditions.

use matrix_e2e_crypto::{CryptoStoreError, OlmError, SetRoomSettingsError};
use thiserror::Error;

/// Result type of the base client.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal representation of errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Attempting to restore a session after the olm-machine has already been
    /// set up fails
    #[error("The olm machine has already been initialized")]
    BadCryptoStoreState,

    /// A session was already restored for this client.
    #[error("The client already has a session")]
    SessionAlreadySet,

    /// The operation needs a logged in client.
    #[error("The client isn't logged in")]
    AuthenticationRequired,

    /// A generic error returned when the state store fails not due to
    /// IO or (de)serialization.
    #[error(transparent)]
    StateStore(#[from] crate::store::StoreError),

    /// An error occurred in the crypto store.
    #[error(transparent)]
    CryptoStore(#[from] CryptoStoreError),

    /// An error occurred during a E2EE operation.
    #[error(transparent)]
    OlmError(#[from] OlmError),

    /// The encryption settings of a room couldn't be changed.
    #[error(transparent)]
    RoomSettings(#[from] SetRoomSettingsError),

    /// There was a [`serde_json`] deserialization error.
    #[error(transparent)]
    DeserializationError(#[from] serde_json::error::Error),
}
