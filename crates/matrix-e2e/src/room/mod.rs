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

//! High-level room API

use std::{collections::BTreeMap, ops::Deref};

use matrix_e2e_base::{
    api::messages,
    deserialized_responses::SyncTimelineEvent,
    events::{RoomEncryptionEventContent, ROOM_ENCRYPTED, ROOM_ENCRYPTION},
    Room as BaseRoom, RoomType,
};
use matrix_e2e_crypto::RoomSettings;
use ruma::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, TransactionId};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use crate::{http_client::ApiRequest, Client, Error, Result};

/// The direction in which new timeline events were added to a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelineDirection {
    /// The events are newer than anything we had, they arrived via sync.
    Forward,
    /// The events are older than anything we had, they were fetched with
    /// [`Room::scrollback`].
    Backward,
}

/// New timeline events of a room.
///
/// Encrypted events are already decrypted, events that couldn't be decrypted
/// are replaced by an `m.bad.encrypted` notice.
#[derive(Clone, Debug)]
pub struct RoomUpdate {
    /// The room the events belong to.
    pub room_id: OwnedRoomId,
    /// Our membership in the room.
    pub room_type: RoomType,
    /// Where the events were added to the timeline.
    pub direction: TimelineDirection,
    /// The events in timeline order, for backwards pagination newest first.
    pub events: Vec<SyncTimelineEvent>,
}

/// How many members of a room we can encrypt for after encryption was
/// enabled.
///
/// Missing users or devices don't make enabling encryption fail, they just
/// won't be able to read our messages until they publish their keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionCoverage {
    /// Members that don't have a single device with published keys.
    pub missing_users: Vec<OwnedUserId>,
    /// Devices we couldn't establish an Olm session with.
    pub missing_devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

impl EncryptionCoverage {
    /// Can every device of every member read our messages.
    pub fn is_complete(&self) -> bool {
        self.missing_users.is_empty() && self.missing_devices.is_empty()
    }
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: OwnedEventId,
}

/// A room the client knows about.
#[derive(Debug, Clone)]
pub struct Room {
    inner: BaseRoom,
    pub(crate) client: Client,
}

impl Deref for Room {
    type Target = BaseRoom;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Room {
    pub(crate) fn new(client: Client, room: BaseRoom) -> Self {
        Self { inner: room, client }
    }

    /// Enable end-to-end encryption in this room.
    ///
    /// Only `m.olm.v1.curve25519-aes-sha2` is supported. The device lists of
    /// all active members are downloaded and Olm sessions are established
    /// with every device we don't share one with yet, our own device
    /// excluded. This is a local policy change, no state event is sent.
    ///
    /// # Arguments
    ///
    /// * `content` - The encryption configuration of the room.
    #[instrument(skip_all, fields(room_id = %self.room_id(), algorithm = %content.algorithm))]
    pub async fn enable_encryption(
        &self,
        content: RoomEncryptionEventContent,
    ) -> Result<EncryptionCoverage> {
        if !content.algorithm.is_supported() {
            return Err(Error::UnknownAlgorithm(content.algorithm.to_string()));
        }

        let machine = self.client.olm_machine().ok_or(Error::CryptoDisabled)?;
        let members = self.active_members();

        machine.enable_room_encryption(self.room_id(), &RoomSettings::olm(members.clone())).await?;
        self.client.base_client().receive_encryption_state(self.room_id(), content).await?;

        let encryption = self.client.encryption();
        encryption.download_keys(members.iter().map(Deref::deref), false).await?;
        let outcome = encryption.establish_sessions(members.iter().map(Deref::deref)).await?;

        let mut missing_users = Vec::new();

        for user_id in &members {
            if user_id == self.own_user_id() {
                continue;
            }

            if machine.get_user_devices(user_id).await?.is_empty() {
                missing_users.push(user_id.clone());
            }
        }

        let coverage =
            EncryptionCoverage { missing_users, missing_devices: outcome.missing_devices };

        info!(
            missing_users = coverage.missing_users.len(),
            missing_devices = coverage.missing_devices.len(),
            "Enabled encryption"
        );

        Ok(coverage)
    }

    /// Stop encrypting messages sent to this room.
    ///
    /// Only the local configuration is cleared, the room keeps its
    /// `m.room.encryption` state on the server. Afterwards
    /// [`BaseRoom::is_encrypted()`], which reflects that state, still returns
    /// `true` while [`Room::is_encryption_enabled()`] returns `false`.
    pub async fn disable_encryption(&self) -> Result<()> {
        let machine = self.client.olm_machine().ok_or(Error::CryptoDisabled)?;
        machine.remove_room_settings(self.room_id()).await?;

        Ok(())
    }

    /// Is a message sent to this room going to be encrypted.
    ///
    /// Unlike [`BaseRoom::is_encrypted()`] this follows the local
    /// configuration, see [`Room::disable_encryption()`].
    pub async fn is_encryption_enabled(&self) -> Result<bool> {
        match self.client.olm_machine() {
            Some(machine) => Ok(machine.is_room_encrypted(self.room_id()).await?),
            None => Ok(false),
        }
    }

    /// Fetch the `m.room.encryption` state of the room from the server.
    ///
    /// The state is applied as if it had been received in a sync. Returns
    /// `false` if the room has no such state, i.e. it isn't encrypted.
    #[instrument(skip(self), fields(room_id = %self.room_id()))]
    pub async fn fetch_encryption_state(&self) -> Result<bool> {
        let request = ApiRequest::get(["rooms", self.room_id().as_str(), "state", ROOM_ENCRYPTION]);

        match self.client.send::<RoomEncryptionEventContent>(request, None).await {
            Ok(content) => {
                debug!(algorithm = %content.algorithm, "Fetched the room encryption state");
                self.client.base_client().receive_encryption_state(self.room_id(), content).await?;
                Ok(true)
            }
            Err(e) if e.as_client_api_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Send a message-like event to this room.
    ///
    /// If encryption is enabled the content is encrypted for every known,
    /// non-blocked device of the active members, missing Olm sessions are
    /// established first. Every call uses a fresh transaction id.
    ///
    /// Returns the id of the new event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of the event, e.g. `m.room.message`.
    ///
    /// * `content` - The content of the event.
    #[instrument(skip(self, content), fields(room_id = %self.room_id()))]
    pub async fn send(&self, event_type: &str, content: JsonValue) -> Result<OwnedEventId> {
        let txn_id = TransactionId::new();

        let encrypted = match self.client.olm_machine() {
            Some(machine) if machine.is_room_encrypted(self.room_id()).await? => {
                let members = self.active_members();
                let encryption = self.client.encryption();

                encryption.download_keys(members.iter().map(Deref::deref), false).await?;
                encryption.establish_sessions(members.iter().map(Deref::deref)).await?;

                let content = machine
                    .encrypt_room_event(
                        self.room_id(),
                        event_type,
                        &content,
                        members.iter().map(Deref::deref),
                    )
                    .await?;

                Some(serde_json::to_value(content)?)
            }
            _ => None,
        };

        let (event_type, content) = match encrypted {
            Some(content) => (ROOM_ENCRYPTED, content),
            None => (event_type, content),
        };

        let request = ApiRequest::put(
            ["rooms", self.room_id().as_str(), "send", event_type, txn_id.as_str()],
            content,
        );
        let response: SendResponse = self.client.send(request, None).await?;

        debug!(event_id = %response.event_id, %txn_id, event_type, "Sent an event");

        Ok(response.event_id)
    }

    /// Fetch older events of the room.
    ///
    /// The events are prepended to the timeline of the room and announced as
    /// a [`RoomUpdate`] in the [`TimelineDirection::Backward`] direction.
    ///
    /// Only one backwards pagination per room is in flight, concurrent calls
    /// wait for it and share its result. After a failure new attempts wait
    /// until three seconds passed. The request keeps running in the
    /// background even if the returned future is dropped.
    ///
    /// # Arguments
    ///
    /// * `limit` - The maximum number of events to fetch.
    pub async fn scrollback(&self, limit: u32) -> Result<()> {
        let handler = self.client.inner.scrollback_handler.clone();
        let room = self.clone();

        tokio::spawn(async move {
            let room_id = room.room_id().to_owned();
            handler.run(room_id, room.paginate_backwards(limit)).await
        })
        .await
        .map_err(|_| Error::BackgroundTaskFailed)?
    }

    #[instrument(skip(self), fields(room_id = %self.room_id()))]
    async fn paginate_backwards(&self, limit: u32) -> Result<()> {
        let Some(from) = self.prev_batch() else {
            debug!("Reached the start of the room, not paginating");
            return Ok(());
        };

        let request = ApiRequest::get(["rooms", self.room_id().as_str(), "messages"]).query([
            ("from", from),
            ("dir", "b".to_owned()),
            ("limit", limit.to_string()),
        ]);

        let response: messages::Response = self.client.send(request, None).await?;
        let events = self.client.base_client().receive_messages(self.room_id(), response).await?;

        self.client.send_room_update(RoomUpdate {
            room_id: self.room_id().to_owned(),
            room_type: self.room_type(),
            direction: TimelineDirection::Backward,
            events,
        });

        Ok(())
    }
}
