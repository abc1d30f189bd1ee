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

use std::{collections::HashSet, fmt, ops::Deref, sync::Arc, time::Instant};

use matrix_e2e_common::deserialized_responses::{SyncTimelineEvent, UnableToDecryptReason};
use matrix_e2e_crypto::{
    store::{DynCryptoStore, IntoCryptoStore, MemoryStore as MemoryCryptoStore, PickleKey},
    OlmMachine, RoomSettings, SetRoomSettingsError,
};
use once_cell::sync::OnceCell;
use ruma::{OneTimeKeyAlgorithm, OwnedEventId, OwnedUserId, RoomId};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    api,
    error::{Error, Result},
    events::{MinimalStateEvent, RoomEncryptionEventContent, ROOM_ENCRYPTED},
    rooms::{Room, RoomInfo, RoomType},
    store::{DynStateStore, IntoStateStore, MemoryStore, StateChanges, Store},
    sync::{InvitedRoom, JoinedRoom, LeftRoom, Rooms, SyncResponse, Timeline},
    Session,
};

/// Configuration for the creation of the [`BaseClient`].
#[must_use]
#[derive(Clone)]
pub struct BaseClientConfig {
    state_store: Option<Arc<DynStateStore>>,
    crypto_store: Option<Arc<DynCryptoStore>>,
    pickle_key: Option<PickleKey>,
    encryption_enabled: bool,
    one_time_key_pool_size: Option<usize>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BaseClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseClientConfig")
            .field("state_store", &self.state_store)
            .field("crypto_store", &self.crypto_store)
            .field("encryption_enabled", &self.encryption_enabled)
            .field("one_time_key_pool_size", &self.one_time_key_pool_size)
            .finish_non_exhaustive()
    }
}

impl Default for BaseClientConfig {
    fn default() -> Self {
        Self {
            state_store: None,
            crypto_store: None,
            pickle_key: None,
            encryption_enabled: true,
            one_time_key_pool_size: None,
        }
    }
}

impl BaseClientConfig {
    /// Create a new default `BaseClientConfig`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set a custom implementation of a `StateStore`.
    ///
    /// The state store is used to persist the room state and the sync token.
    /// Defaults to an in-memory store.
    pub fn state_store(mut self, store: impl IntoStateStore) -> Self {
        self.state_store = Some(store.into_state_store());
        self
    }

    /// Set a custom implementation of a `CryptoStore`.
    ///
    /// Defaults to an in-memory store, keys won't survive a restart.
    pub fn crypto_store(mut self, store: impl IntoCryptoStore) -> Self {
        self.crypto_store = Some(store.into_crypto_store());
        self
    }

    /// Set the key the account and sessions are encrypted with before they
    /// hit the crypto store.
    ///
    /// A random key is generated if none is set, which only makes sense for
    /// in-memory stores.
    pub fn pickle_key(mut self, pickle_key: PickleKey) -> Self {
        self.pickle_key = Some(pickle_key);
        self
    }

    /// Turn end-to-end encryption support on or off, it's on by default.
    ///
    /// Without it no [`OlmMachine`] is created and encrypted events are
    /// replaced by `m.bad.encrypted` messages.
    pub fn encryption_enabled(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    /// Limit the number of one-time keys the device keeps published on the
    /// server.
    pub fn one_time_key_pool_size(mut self, size: usize) -> Self {
        self.one_time_key_pool_size = Some(size);
        self
    }
}

/// A no IO Client implementation.
///
/// This Client is a state machine that receives responses and events and
/// accordingly updates its state.
#[derive(Clone)]
pub struct BaseClient {
    /// Database
    pub(crate) store: Store,
    /// The store used for encryption
    crypto_store: Arc<DynCryptoStore>,
    pickle_key: PickleKey,
    encryption_enabled: bool,
    one_time_key_pool_size: Option<usize>,
    /// The olm-machine that is created once the [`Session`] is set via
    /// [`BaseClient::restore_session`]
    olm_machine: Arc<OnceCell<OlmMachine>>,
    /// Held while a response is merged into the [`RoomInfo`]s, the merges
    /// read and replace whole room infos across await points.
    room_info_lock: Arc<Mutex<()>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.store.session())
            .field("sync_token", &self.store.sync_token)
            .field("encryption_enabled", &self.encryption_enabled)
            .finish()
    }
}

impl BaseClient {
    /// Create a new default client.
    pub fn new() -> Self {
        BaseClient::with_config(BaseClientConfig::default())
    }

    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `config` - The stores and the crypto settings of the client.
    pub fn with_config(config: BaseClientConfig) -> Self {
        let state_store =
            config.state_store.unwrap_or_else(|| MemoryStore::new().into_state_store());
        let crypto_store =
            config.crypto_store.unwrap_or_else(|| MemoryCryptoStore::new().into_crypto_store());

        BaseClient {
            store: Store::new(state_store),
            crypto_store,
            pickle_key: config.pickle_key.unwrap_or_default(),
            encryption_enabled: config.encryption_enabled,
            one_time_key_pool_size: config.one_time_key_pool_size,
            olm_machine: Default::default(),
            room_info_lock: Default::default(),
        }
    }

    /// The current session, if the client is logged in.
    pub fn session(&self) -> Option<&Session> {
        self.store.session()
    }

    /// Is the client logged in.
    pub fn logged_in(&self) -> bool {
        self.store.session().is_some()
    }

    /// Is end-to-end encryption support turned on for this client.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled
    }

    /// Get the state store of the client.
    pub fn store(&self) -> &DynStateStore {
        self.store.deref()
    }

    /// Restore a previously logged in session.
    ///
    /// Loads the rooms and the sync token from the state store and, if
    /// encryption is enabled, the Olm account from the crypto store.
    ///
    /// # Arguments
    ///
    /// * `session` - An session that the user already has from a previous login
    ///   call.
    pub async fn restore_session(&self, session: Session) -> Result<()> {
        if self.logged_in() {
            return Err(Error::SessionAlreadySet);
        }

        debug!(user_id = %session.user_id, device_id = %session.device_id, "Restoring login");

        if self.encryption_enabled {
            let olm_machine = OlmMachine::with_store(
                &session.user_id,
                &session.device_id,
                self.crypto_store.clone(),
                self.pickle_key.clone(),
            )
            .await?;

            if let Some(size) = self.one_time_key_pool_size {
                olm_machine.set_one_time_key_pool_size(size);
            }

            if self.olm_machine.set(olm_machine).is_err() {
                return Err(Error::BadCryptoStoreState);
            }
        }

        self.store.restore_session(session).await?;

        Ok(())
    }

    /// Get the olm machine, `None` if encryption is disabled or the client
    /// isn't logged in yet.
    pub fn olm_machine(&self) -> Option<&OlmMachine> {
        self.olm_machine.get()
    }

    /// Get the current, if any, sync token of the client.
    /// This will be None if the client didn't sync at least once.
    pub async fn sync_token(&self) -> Option<String> {
        self.store.sync_token.read().await.clone()
    }

    /// Get all the rooms this client knows about.
    pub fn get_rooms(&self) -> Vec<Room> {
        self.store.get_rooms()
    }

    /// Lookup the Room for the given RoomId, or `None` if it doesn't exist.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.store.get_room(room_id)
    }

    fn own_user_id(&self) -> Result<OwnedUserId> {
        self.store.session().map(|s| s.user_id.clone()).ok_or(Error::AuthenticationRequired)
    }

    /// Turn a raw timeline event into a [`SyncTimelineEvent`], decrypting it
    /// if needed.
    async fn handle_event(&self, room_id: &RoomId, event: JsonValue) -> Result<SyncTimelineEvent> {
        if event.get("type").and_then(JsonValue::as_str) != Some(ROOM_ENCRYPTED) {
            return Ok(SyncTimelineEvent::new(event));
        }

        match self.olm_machine() {
            Some(olm) => Ok(olm.decrypt_room_event(&event, room_id).await?),
            None => {
                trace!(?room_id, "Received an encrypted event while encryption is disabled");
                Ok(SyncTimelineEvent::new_utd_event(
                    &event,
                    UnableToDecryptReason::EncryptionNotEnabled,
                ))
            }
        }
    }

    pub(crate) fn handle_state(
        &self,
        events: &[JsonValue],
        room_info: &mut RoomInfo,
        changes: &mut StateChanges,
    ) {
        let room_id = room_info.room_id.clone();

        for raw_event in events {
            let event = match MinimalStateEvent::from_json(raw_event) {
                Ok(e) => e,
                Err(e) => {
                    warn!(%room_id, "Couldn't deserialize state event: {e:?}");
                    continue;
                }
            };

            room_info.handle_state_event(&event);
            changes.add_state_event(&room_id, &event, raw_event.clone());
        }
    }

    async fn handle_timeline(
        &self,
        room: &Room,
        api_timeline: api::sync_events::Timeline,
        room_info: &mut RoomInfo,
        changes: &mut StateChanges,
    ) -> Result<Timeline> {
        let room_id = room.room_id();
        let mut timeline = Timeline::new(api_timeline.limited, api_timeline.prev_batch);
        let mut seen: HashSet<OwnedEventId> = HashSet::new();

        for raw_event in api_timeline.events {
            if let Some(event_id) = raw_event
                .get("event_id")
                .and_then(|id| serde_json::from_value::<OwnedEventId>(id.clone()).ok())
            {
                // A limited timeline replaces what we hold, so only events from
                // this very batch count as duplicates.
                let known = !timeline.limited && room.has_event(&event_id);

                if known || !seen.insert(event_id.clone()) {
                    trace!(%room_id, %event_id, "Skipping a duplicate timeline event");
                    continue;
                }
            }

            if raw_event.get("state_key").is_some() {
                match MinimalStateEvent::from_json(&raw_event) {
                    Ok(state) => {
                        room_info.handle_state_event(&state);
                        changes.add_state_event(room_id, &state, raw_event.clone());
                    }
                    Err(e) => warn!(%room_id, "Couldn't deserialize a timeline state event: {e:?}"),
                }
            }

            timeline.events.push(self.handle_event(room_id, raw_event).await?);
        }

        Ok(timeline)
    }

    /// Forward a newly observed room encryption configuration to the olm
    /// machine, and make sure we track the devices of the room members.
    async fn handle_encryption_change(
        &self,
        room_info: &RoomInfo,
        was_encrypted: bool,
    ) -> Result<()> {
        let (Some(olm), Some(encryption)) = (self.olm_machine(), room_info.encryption()) else {
            return Ok(());
        };

        let members: Vec<OwnedUserId> = room_info.active_members().map(ToOwned::to_owned).collect();

        if !was_encrypted {
            let settings =
                RoomSettings { algorithm: encryption.algorithm.clone(), members: members.clone() };

            match olm.set_room_settings(room_info.room_id(), &settings).await {
                Ok(()) => {}
                Err(SetRoomSettingsError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(
                        room_id = ?room_info.room_id(),
                        "Not applying room encryption settings: {e}"
                    )
                }
            }
        }

        olm.update_tracked_users(members.iter().map(Deref::deref)).await?;

        Ok(())
    }

    /// Should the pagination token of the room be replaced by the one of the
    /// given timeline.
    fn takes_prev_batch(room: &Room, timeline: &Timeline) -> bool {
        timeline.limited || room.timeline().is_empty()
    }

    /// Receive a response from a sync call.
    ///
    /// State events are merged in server order, timelines are deduplicated by
    /// event id and encrypted events are decrypted. The sync token is only
    /// committed once every change has been saved to the store.
    ///
    /// # Arguments
    ///
    /// * `response` - The response that we received after a successful sync.
    #[instrument(skip_all, fields(next_batch = response.next_batch))]
    pub async fn receive_sync_response(
        &self,
        response: api::sync_events::Response,
    ) -> Result<SyncResponse> {
        let api::sync_events::Response {
            next_batch,
            rooms,
            device_lists,
            device_one_time_keys_count,
        } = response;

        let own_user_id = self.own_user_id()?;
        let _guard = self.room_info_lock.lock().await;

        // The server might respond multiple times with the same sync token, in
        // that case we already received this response and there's nothing to
        // do.
        if self.store.sync_token.read().await.as_ref() == Some(&next_batch) {
            debug!("Skipping an already processed sync response");
            return Ok(SyncResponse::new(next_batch));
        }

        let now = Instant::now();

        if let Some(o) = self.olm_machine() {
            o.receive_device_list_changes(&device_lists.changed, &device_lists.left).await?;

            if let Some(count) =
                device_one_time_keys_count.get(&OneTimeKeyAlgorithm::SignedCurve25519)
            {
                o.update_one_time_key_count(*count).await?;
            }
        }

        let mut changes = StateChanges::new(next_batch.clone());
        let mut new_rooms = Rooms::default();
        let mut timelines = Vec::new();

        for (room_id, new_info) in rooms.join {
            let room = self.store.get_or_create_room(&own_user_id, &room_id, RoomType::Joined);
            let mut room_info = room.clone_info();
            let was_encrypted = room_info.is_encrypted();
            room_info.mark_as_joined();

            self.handle_state(&new_info.state.events, &mut room_info, &mut changes);

            let timeline =
                self.handle_timeline(&room, new_info.timeline, &mut room_info, &mut changes).await?;

            if Self::takes_prev_batch(&room, &timeline) {
                room_info.set_prev_batch(timeline.prev_batch.as_deref());
            }

            self.handle_encryption_change(&room_info, was_encrypted).await?;

            timelines.push((room, timeline.clone()));
            new_rooms
                .join
                .insert(room_id, JoinedRoom { timeline, state: new_info.state.events });
            changes.add_room(room_info);
        }

        for (room_id, new_info) in rooms.leave {
            let room = self.store.get_or_create_room(&own_user_id, &room_id, RoomType::Left);
            let mut room_info = room.clone_info();
            room_info.mark_as_left();

            self.handle_state(&new_info.state.events, &mut room_info, &mut changes);

            let timeline =
                self.handle_timeline(&room, new_info.timeline, &mut room_info, &mut changes).await?;

            if Self::takes_prev_batch(&room, &timeline) {
                room_info.set_prev_batch(timeline.prev_batch.as_deref());
            }

            timelines.push((room, timeline.clone()));
            new_rooms.leave.insert(room_id, LeftRoom { timeline, state: new_info.state.events });
            changes.add_room(room_info);
        }

        for (room_id, new_info) in rooms.invite {
            let room = self.store.get_or_create_room(&own_user_id, &room_id, RoomType::Invited);
            let mut room_info = room.clone_info();
            room_info.mark_as_invited();

            self.handle_state(&new_info.invite_state.events, &mut room_info, &mut changes);

            new_rooms
                .invite
                .insert(room_id, InvitedRoom { invite_state: new_info.invite_state.events });
            changes.add_room(room_info);
        }

        if let Some(o) = self.olm_machine() {
            o.update_tracked_users(device_lists.changed.iter().map(Deref::deref)).await?;
        }

        self.store.save_changes(&changes).await?;
        *self.store.sync_token.write().await = Some(next_batch.clone());
        self.apply_changes(&changes);

        for (room, timeline) in timelines {
            if timeline.limited {
                room.reset_timeline();
            }
            room.append_timeline(timeline.events);
        }

        info!("Processed a sync response in {:?}", now.elapsed());

        Ok(SyncResponse {
            next_batch,
            rooms: new_rooms,
            device_lists,
            device_one_time_keys_count,
        })
    }

    pub(crate) fn apply_changes(&self, changes: &StateChanges) {
        for (room_id, room_info) in &changes.room_infos {
            if let Some(room) = self.store.get_room(room_id) {
                room.set_room_info(room_info.clone())
            }
        }
    }

    /// Receive a response of a `/rooms/{roomId}/messages` request that
    /// paginated backwards from the oldest event of the room.
    ///
    /// Returns the events that we didn't hold yet, newest first, after they
    /// got prepended to the room timeline. The pagination token of the room
    /// moves to the `end` of the response, a missing `end` means the start of
    /// the room was reached.
    #[instrument(skip(self, response))]
    pub async fn receive_messages(
        &self,
        room_id: &RoomId,
        response: api::messages::Response,
    ) -> Result<Vec<SyncTimelineEvent>> {
        let own_user_id = self.own_user_id()?;
        let _guard = self.room_info_lock.lock().await;

        let room = self.store.get_or_create_room(&own_user_id, room_id, RoomType::Joined);
        let mut room_info = room.clone_info();
        let mut seen: HashSet<OwnedEventId> = HashSet::new();
        let mut events = Vec::with_capacity(response.chunk.len());

        for raw_event in response.chunk {
            if let Some(event_id) = raw_event
                .get("event_id")
                .and_then(|id| serde_json::from_value::<OwnedEventId>(id.clone()).ok())
            {
                if room.has_event(&event_id) || !seen.insert(event_id) {
                    continue;
                }
            }

            events.push(self.handle_event(room_id, raw_event).await?);
        }

        room_info.set_prev_batch(response.end.as_deref());

        let mut changes = StateChanges::default();
        changes.add_room(room_info);
        self.store.save_changes(&changes).await?;
        self.apply_changes(&changes);

        room.prepend_timeline(events.clone());

        debug!(new_events = events.len(), prev_batch = ?room.prev_batch(), "Received messages");

        Ok(events)
    }

    /// Apply an `m.room.encryption` state content that was fetched from the
    /// server or chosen locally, as if it had been received in a sync.
    ///
    /// A conflicting configuration for an already encrypted room is ignored.
    pub async fn receive_encryption_state(
        &self,
        room_id: &RoomId,
        content: RoomEncryptionEventContent,
    ) -> Result<Room> {
        let own_user_id = self.own_user_id()?;
        let _guard = self.room_info_lock.lock().await;

        let room = self.store.get_or_create_room(&own_user_id, room_id, RoomType::Joined);
        let mut room_info = room.clone_info();
        let was_encrypted = room_info.is_encrypted();

        if room_info.handle_encryption_content(content) {
            self.handle_encryption_change(&room_info, was_encrypted).await?;

            let mut changes = StateChanges::default();
            changes.add_room(room_info);
            self.store.save_changes(&changes).await?;
            self.apply_changes(&changes);
        }

        Ok(room)
    }
}

impl Default for BaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use matrix_e2e_common::deserialized_responses::{TimelineEventKind, UnableToDecryptReason};
    use matrix_e2e_test::{
        sync_timeline_event, JoinedRoomBuilder, StateTestEvent, SyncResponseBuilder,
        DEFAULT_TEST_ROOM_ID,
    };
    use ruma::{device_id, event_id, user_id, RoomId};
    use serde_json::{json, Value as JsonValue};
    use tokio::sync::oneshot;

    use super::{BaseClient, BaseClientConfig};
    use crate::{
        api,
        events::{ROOM_ENCRYPTION, ROOM_NAME},
        store::{MemoryStore, Result as StoreResult, StateStore},
        Error, RoomInfo, Session, StateChanges,
    };

    fn session() -> Session {
        Session {
            access_token: "1234".to_owned(),
            user_id: user_id!("@example:localhost").to_owned(),
            device_id: device_id!("DEVICEID").to_owned(),
        }
    }

    async fn logged_in_client(config: BaseClientConfig) -> BaseClient {
        let client = BaseClient::with_config(config);
        client.restore_session(session()).await.unwrap();
        client
    }

    fn message(event_id: &str) -> serde_json::Value {
        sync_timeline_event!({
            "content": { "body": "hello", "msgtype": "m.text" },
            "event_id": event_id,
            "origin_server_ts": 152037280,
            "sender": "@example:localhost",
            "type": "m.room.message",
        })
    }

    fn room_name(name: &str, event_id: &str) -> StateTestEvent {
        StateTestEvent::Custom(json!({
            "content": { "name": name },
            "event_id": event_id,
            "origin_server_ts": 151957878,
            "sender": "@example:localhost",
            "state_key": "",
            "type": "m.room.name",
        }))
    }

    #[tokio::test]
    async fn test_sync_requires_a_session() {
        let client = BaseClient::new();
        let response: api::sync_events::Response =
            SyncResponseBuilder::new().build_sync_response();

        assert_matches!(
            client.receive_sync_response(response).await,
            Err(Error::AuthenticationRequired)
        );
    }

    #[tokio::test]
    async fn test_session_can_only_be_restored_once() {
        let client = logged_in_client(BaseClientConfig::new()).await;

        assert!(client.logged_in());
        assert!(client.olm_machine().is_some());
        assert_matches!(client.restore_session(session()).await, Err(Error::SessionAlreadySet));
    }

    #[tokio::test]
    async fn test_last_state_event_wins() {
        let client = logged_in_client(BaseClientConfig::new()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let response = SyncResponseBuilder::new()
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_state_event(room_name("first", "$first:localhost"))
                    .add_state_event(room_name("second", "$second:localhost")),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();

        let room = client.get_room(room_id).unwrap();
        assert_eq!(room.name().as_deref(), Some("second"));

        let event = room.get_state_event(ROOM_NAME, "").await.unwrap().unwrap();
        assert_eq!(event["event_id"], "$second:localhost");
    }

    #[tokio::test]
    async fn test_same_sync_response_twice() {
        let client = logged_in_client(BaseClientConfig::new()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let mut builder = SyncResponseBuilder::new();
        builder.add_joined_room(
            JoinedRoomBuilder::new(room_id)
                .add_state_event(StateTestEvent::Member)
                .add_timeline_event(message("$a:localhost"))
                .add_timeline_event(message("$b:localhost")),
        );
        let json = builder.build_json_sync_response();

        let response: api::sync_events::Response = serde_json::from_value(json.clone()).unwrap();
        let first = client.receive_sync_response(response).await.unwrap();
        assert_eq!(first.rooms.join[room_id].timeline.events.len(), 2);

        // The very same response is skipped as a whole.
        let response: api::sync_events::Response = serde_json::from_value(json.clone()).unwrap();
        let second = client.receive_sync_response(response).await.unwrap();
        assert!(second.rooms.join.is_empty());

        // A new batch repeating old events only yields the unknown ones.
        let mut json = json;
        json["next_batch"] = "another_batch".into();
        json["rooms"]["join"][room_id.as_str()]["timeline"]["events"]
            .as_array_mut()
            .unwrap()
            .push(message("$c:localhost"));

        let response: api::sync_events::Response = serde_json::from_value(json).unwrap();
        let third = client.receive_sync_response(response).await.unwrap();
        let new_events = &third.rooms.join[room_id].timeline.events;
        assert_eq!(new_events.len(), 1);
        assert_eq!(new_events[0].event_id().as_deref(), Some(event_id!("$c:localhost")));

        let room = client.get_room(room_id).unwrap();
        assert_eq!(room.timeline().len(), 3);
        assert_eq!(client.sync_token().await.as_deref(), Some("another_batch"));
    }

    #[tokio::test]
    async fn test_encrypted_room_is_registered_with_the_olm_machine() {
        let client = logged_in_client(BaseClientConfig::new()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let response = SyncResponseBuilder::new()
            .add_joined_room(JoinedRoomBuilder::new(room_id).add_state_bulk([
                StateTestEvent::Member.into(),
                StateTestEvent::MemberAdditional.into(),
                StateTestEvent::Encryption.into(),
            ]))
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();

        let room = client.get_room(room_id).unwrap();
        assert!(room.is_encrypted());
        assert!(room.get_state_event(ROOM_ENCRYPTION, "").await.unwrap().is_some());

        let olm = client.olm_machine().unwrap();
        let settings = olm.room_settings(room_id).await.unwrap().unwrap();
        assert_eq!(settings.members.len(), 2);

        let tracked = olm.tracked_users().await;
        assert!(tracked.contains(&user_id!("@bob:localhost").to_owned()));
    }

    #[tokio::test]
    async fn test_encrypted_events_without_encryption_support() {
        let client = logged_in_client(BaseClientConfig::new().encryption_enabled(false)).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;
        assert!(client.olm_machine().is_none());

        let encrypted = sync_timeline_event!({
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "ciphertext": {},
                "sender_key": "Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw",
            },
            "event_id": "$encrypted:localhost",
            "origin_server_ts": 152037280,
            "sender": "@example:localhost",
            "type": "m.room.encrypted",
        });

        let response = SyncResponseBuilder::new()
            .add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(encrypted))
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();

        let timeline = client.get_room(room_id).unwrap().timeline();
        assert_eq!(timeline.len(), 1);
        assert_matches!(
            timeline[0].kind,
            TimelineEventKind::UnableToDecrypt {
                reason: UnableToDecryptReason::EncryptionNotEnabled
            }
        );
        assert_eq!(timeline[0].event_id().as_deref(), Some(event_id!("$encrypted:localhost")));
    }

    #[tokio::test]
    async fn test_encrypted_event_not_meant_for_us() {
        let client = logged_in_client(BaseClientConfig::new()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let encrypted = sync_timeline_event!({
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "ciphertext": {
                    "someoneelsescurve25519keyxxxxxxxxxxxxxxxxxx": { "type": 0, "body": "AwogAAAA" }
                },
                "sender_key": "Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw",
            },
            "event_id": "$encrypted:localhost",
            "origin_server_ts": 152037280,
            "sender": "@example:localhost",
            "type": "m.room.encrypted",
        });

        let response = SyncResponseBuilder::new()
            .add_joined_room(JoinedRoomBuilder::new(room_id).add_timeline_event(encrypted))
            .build_sync_response();
        let sync = client.receive_sync_response(response).await.unwrap();

        let event = &sync.rooms.join[room_id].timeline.events[0];
        assert_matches!(
            event.kind,
            TimelineEventKind::UnableToDecrypt {
                reason: UnableToDecryptReason::NotIncludedInRecipients
            }
        );
        assert_eq!(event.content().unwrap()["body"], "Not included in recipients");
    }

    #[tokio::test]
    async fn test_prev_batch_tracking() {
        let client = logged_in_client(BaseClientConfig::new()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;
        let mut builder = SyncResponseBuilder::new();

        let response = builder
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_timeline_event(message("$c:localhost"))
                    .set_timeline_prev_batch("first_prev_batch"),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();
        let room = client.get_room(room_id).unwrap();
        assert_eq!(room.prev_batch().as_deref(), Some("first_prev_batch"));

        // A gapless follow-up keeps the token of our oldest event.
        let response = builder
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_timeline_event(message("$d:localhost"))
                    .set_timeline_prev_batch("second_prev_batch"),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();
        assert_eq!(room.prev_batch().as_deref(), Some("first_prev_batch"));

        let messages = api::messages::Response {
            start: Some("first_prev_batch".to_owned()),
            end: Some("older".to_owned()),
            chunk: vec![message("$b:localhost"), message("$a:localhost"), message("$c:localhost")],
        };
        let events = client.receive_messages(room_id, messages).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(room.prev_batch().as_deref(), Some("older"));

        let ids: Vec<_> =
            room.timeline().iter().filter_map(|e| e.event_id().map(|id| id.to_string())).collect();
        assert_eq!(ids, vec!["$a:localhost", "$b:localhost", "$c:localhost", "$d:localhost"]);

        let messages =
            api::messages::Response { start: Some("older".to_owned()), end: None, chunk: vec![] };
        client.receive_messages(room_id, messages).await.unwrap();
        assert_eq!(room.prev_batch(), None);

        // A limited timeline replaces what we hold locally.
        let response = builder
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_timeline_event(message("$z:localhost"))
                    .set_timeline_limited()
                    .set_timeline_prev_batch("after_the_gap"),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();
        assert_eq!(room.prev_batch().as_deref(), Some("after_the_gap"));
        assert_eq!(room.timeline().len(), 1);
    }

    #[tokio::test]
    async fn test_rooms_survive_a_restart() {
        let store = Arc::new(MemoryStore::new());
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let client = logged_in_client(BaseClientConfig::new().state_store(store.clone())).await;
        let response = SyncResponseBuilder::new()
            .add_joined_room(
                JoinedRoomBuilder::new(room_id).add_state_event(StateTestEvent::RoomName),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();
        let token = client.sync_token().await;

        let client = logged_in_client(BaseClientConfig::new().state_store(store)).await;
        assert_eq!(client.sync_token().await, token);
        assert_eq!(client.get_room(room_id).unwrap().name().as_deref(), Some("room name"));
    }

    /// A memory store that can hold back its next write until told to go on.
    #[derive(Debug, Default)]
    struct PausingStore {
        inner: MemoryStore,
        pause: StdMutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    impl PausingStore {
        /// Pause the next `save_changes()` call, returns a receiver that fires
        /// once the call is paused and a sender that resumes it.
        fn pause_next_write(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (paused_tx, paused_rx) = oneshot::channel();
            let (resume_tx, resume_rx) = oneshot::channel();
            *self.pause.lock().unwrap() = Some((paused_tx, resume_rx));
            (paused_rx, resume_tx)
        }
    }

    #[async_trait]
    impl StateStore for PausingStore {
        async fn save_changes(&self, changes: &StateChanges) -> StoreResult<()> {
            let pause = self.pause.lock().unwrap().take();

            if let Some((paused, resume)) = pause {
                paused.send(()).unwrap();
                resume.await.unwrap();
            }

            self.inner.save_changes(changes).await
        }

        async fn get_sync_token(&self) -> StoreResult<Option<String>> {
            self.inner.get_sync_token().await
        }

        async fn get_room_infos(&self) -> StoreResult<Vec<RoomInfo>> {
            self.inner.get_room_infos().await
        }

        async fn get_state_event(
            &self,
            room_id: &RoomId,
            event_type: &str,
            state_key: &str,
        ) -> StoreResult<Option<JsonValue>> {
            self.inner.get_state_event(room_id, event_type, state_key).await
        }

        async fn get_state_events(
            &self,
            room_id: &RoomId,
            event_type: &str,
        ) -> StoreResult<Vec<JsonValue>> {
            self.inner.get_state_events(room_id, event_type).await
        }
    }

    #[tokio::test]
    async fn test_back_pagination_and_sync_dont_overwrite_each_other() {
        let store = Arc::new(PausingStore::default());
        let client = logged_in_client(BaseClientConfig::new().state_store(store.clone())).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;
        let mut builder = SyncResponseBuilder::new();

        let response = builder
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_timeline_event(message("$b:localhost"))
                    .set_timeline_prev_batch("first_prev_batch"),
            )
            .build_sync_response();
        client.receive_sync_response(response).await.unwrap();

        // Stop the back pagination right before it stores the room info it
        // read.
        let (paused, resume) = store.pause_next_write();
        let messages = api::messages::Response {
            start: Some("first_prev_batch".to_owned()),
            end: Some("older".to_owned()),
            chunk: vec![message("$a:localhost")],
        };
        let pagination = tokio::spawn({
            let client = client.clone();
            async move { client.receive_messages(room_id, messages).await }
        });
        paused.await.unwrap();

        let response = builder
            .add_joined_room(
                JoinedRoomBuilder::new(room_id)
                    .add_state_event(room_name("renamed", "$name:localhost"))
                    .add_timeline_event(message("$c:localhost")),
            )
            .build_sync_response();
        let sync = tokio::spawn({
            let client = client.clone();
            async move { client.receive_sync_response(response).await }
        });

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!sync.is_finished(), "the sync was merged while a pagination was in progress");

        resume.send(()).unwrap();
        assert_eq!(pagination.await.unwrap().unwrap().len(), 1);
        sync.await.unwrap().unwrap();

        let room = client.get_room(room_id).unwrap();
        assert_eq!(room.name().as_deref(), Some("renamed"));
        assert_eq!(room.prev_batch().as_deref(), Some("older"));

        let ids: Vec<_> =
            room.timeline().iter().filter_map(|e| e.event_id().map(|id| id.to_string())).collect();
        assert_eq!(ids, vec!["$a:localhost", "$b:localhost", "$c:localhost"]);
    }
}
