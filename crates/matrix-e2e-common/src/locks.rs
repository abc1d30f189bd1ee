// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Simplified locks that hide the poisoning of the std locks.
//!
//! A poisoned lock only means another thread panicked while holding it, the
//! protected maps stay structurally valid so we keep using them.

use std::sync::{
    Mutex as StdMutex, MutexGuard, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A wrapper around [`std::sync::RwLock`] whose guards can't fail.
#[derive(Debug, Default)]
pub struct RwLock<T>(StdRwLock<T>);

impl<T> RwLock<T> {
    /// Create a new lock protecting the given value.
    pub const fn new(value: T) -> Self {
        Self(StdRwLock::new(value))
    }

    /// Lock for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Serialize> Serialize for RwLock<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.read().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for RwLock<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::new)
    }
}

/// A wrapper around [`std::sync::Mutex`] whose guard can't fail.
#[derive(Debug, Default)]
pub struct Mutex<T>(StdMutex<T>);

impl<T> Mutex<T> {
    /// Create a new mutex protecting the given value.
    pub const fn new(value: T) -> Self {
        Self(StdMutex::new(value))
    }

    /// Acquire the mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::RwLock;

    #[test]
    fn test_lock_serializes_as_its_value() {
        let lock = RwLock::new(5u8);
        assert_eq!(serde_json::to_string(&lock).unwrap(), "5");

        let lock: RwLock<u8> = serde_json::from_str("7").unwrap();
        *lock.write() += 1;
        assert_eq!(*lock.read(), 8);
    }
}
