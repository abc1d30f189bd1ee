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

//! The state store holds the room state and the sync token between restarts.
//!
//! The [`MemoryStore`] is the default, a persistent store lives in the
//! `matrix-e2e-sqlite` crate.

use std::{
    collections::BTreeMap,
    fmt,
    ops::Deref,
    sync::Arc,
};

use matrix_e2e_common::locks::RwLock as StdRwLock;
use once_cell::sync::OnceCell;
use ruma::{OwnedRoomId, RoomId, UserId};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{
    events::MinimalStateEvent,
    rooms::{Room, RoomInfo, RoomType},
    Session,
};

mod memory_store;
mod traits;

pub use memory_store::MemoryStore;
pub use traits::{DynStateStore, IntoStateStore, StateStore};

/// State store specific error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An error happened while serializing or deserializing some data.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An error happened while deserializing a Matrix identifier, e.g. an user
    /// id.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),
}

impl StoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `Result` type with the `StoreError` as the default error type.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A set of changes collected while processing a sync or a `/messages`
/// response, saved to the store in one go.
#[derive(Clone, Debug, Default)]
pub struct StateChanges {
    /// The sync token that relates to this update.
    pub sync_token: Option<String>,
    /// A mapping of `RoomId` to a map of event type to a map of state key to
    /// the raw state event.
    ///
    /// Later events for the same key replace earlier ones.
    pub state: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeMap<String, JsonValue>>>,
    /// A map of `RoomId` to `RoomInfo`.
    pub room_infos: BTreeMap<OwnedRoomId, RoomInfo>,
}

impl StateChanges {
    /// Create a new `StateChanges` struct with the given sync_token.
    pub fn new(sync_token: String) -> Self {
        Self { sync_token: Some(sync_token), ..Default::default() }
    }

    /// Update the `StateChanges` struct with the given `RoomInfo`.
    pub fn add_room(&mut self, room: RoomInfo) {
        self.room_infos.insert(room.room_id.clone(), room);
    }

    /// Update the `StateChanges` struct with the given room with a new
    /// state event.
    pub fn add_state_event(&mut self, room_id: &RoomId, event: &MinimalStateEvent, raw: JsonValue) {
        self.state
            .entry(room_id.to_owned())
            .or_default()
            .entry(event.event_type.clone())
            .or_default()
            .insert(event.state_key.clone(), raw);
    }
}

/// A state store wrapper for the SDK.
///
/// This adds additional higher level store functionality on top of a
/// `StateStore` implementation and keeps the loaded rooms in memory.
#[derive(Clone)]
pub(crate) struct Store {
    inner: Arc<DynStateStore>,
    session: Arc<OnceCell<Session>>,
    /// The current sync token that should be used for the next sync call.
    pub(crate) sync_token: Arc<RwLock<Option<String>>>,
    rooms: Arc<StdRwLock<BTreeMap<OwnedRoomId, Room>>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(inner: Arc<DynStateStore>) -> Self {
        Self {
            inner,
            session: Default::default(),
            sync_token: Default::default(),
            rooms: Default::default(),
        }
    }

    /// Restore the access to the Store from the given `Session`, overwrites
    /// any previously existing access to the Store.
    pub async fn restore_session(&self, session: Session) -> Result<()> {
        for info in self.inner.get_room_infos().await? {
            let room = Room::restore(&session.user_id, self.inner.clone(), info);
            self.rooms.write().insert(room.room_id().to_owned(), room);
        }

        let token = self.get_sync_token().await?;
        *self.sync_token.write().await = token;

        // The caller checks that no session was set before.
        let _ = self.session.set(session);

        Ok(())
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.get()
    }

    /// Get all the rooms this store knows about.
    pub fn get_rooms(&self) -> Vec<Room> {
        self.rooms.read().values().cloned().collect()
    }

    /// Get the room with the given room id.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.read().get(room_id).cloned()
    }

    /// Lookup the room with the given room id or create a new one of the
    /// given type.
    pub fn get_or_create_room(
        &self,
        own_user_id: &UserId,
        room_id: &RoomId,
        room_type: RoomType,
    ) -> Room {
        self.rooms
            .write()
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(own_user_id, self.inner.clone(), room_id, room_type))
            .clone()
    }
}

impl Deref for Store {
    type Target = DynStateStore;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}
