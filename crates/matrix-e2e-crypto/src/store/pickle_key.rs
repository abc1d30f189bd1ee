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

use std::fmt;

use rand::{thread_rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_SIZE: usize = 32;

/// A pickle key that will be used to encrypt all the private keys for Olm.
///
/// Olm uses AES256 to encrypt accounts and sessions, the key is held only
/// in memory and zeroized once it's dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct PickleKey {
    aes256_key: [u8; KEY_SIZE],
}

impl Default for PickleKey {
    fn default() -> Self {
        let mut aes256_key = [0u8; KEY_SIZE];
        thread_rng().fill_bytes(&mut aes256_key);

        Self { aes256_key }
    }
}

impl TryFrom<&[u8]> for PickleKey {
    type Error = InvalidPickleKeyLength;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let aes256_key = value.try_into().map_err(|_| InvalidPickleKeyLength(value.len()))?;
        Ok(Self { aes256_key })
    }
}

impl From<[u8; KEY_SIZE]> for PickleKey {
    fn from(aes256_key: [u8; KEY_SIZE]) -> Self {
        Self { aes256_key }
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickleKey").finish_non_exhaustive()
    }
}

impl PickleKey {
    /// Generate a new random pickle key.
    pub fn new() -> Self {
        Default::default()
    }

    /// Get the raw AES256 key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.aes256_key
    }
}

/// The given bytes can't be used as a pickle key.
#[derive(Debug, thiserror::Error)]
#[error("a pickle key needs to be {KEY_SIZE} bytes long, got {0} bytes")]
pub struct InvalidPickleKeyLength(usize);
