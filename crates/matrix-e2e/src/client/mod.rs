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
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

use matrix_e2e_base::{BaseClient, Session};
use matrix_e2e_crypto::OlmMachine;
use ruma::{DeviceId, OwnedRoomId, RoomId, UserId};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    config::RequestConfig,
    deduplicating_handler::DeduplicatingHandler,
    encryption::{CryptoEvent, Encryption},
    error::HttpResult,
    http_client::{ApiRequest, HttpClient},
    room::{Room, RoomUpdate},
    sync::SyncControl,
    Result,
};

mod builder;

pub use self::builder::{ClientBuildError, ClientBuilder};

/// How long a failed backwards pagination blocks new attempts for the same
/// room.
pub(crate) const SCROLLBACK_COOLDOWN: Duration = Duration::from_millis(3000);

const CHANNEL_CAPACITY: usize = 100;

/// An async/await enabled Matrix client.
///
/// All of the state is held in an `Arc` so the `Client` can be cloned freely.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    /// The URL of the homeserver to connect to.
    homeserver: Url,
    /// The underlying HTTP client.
    http_client: HttpClient,
    /// User session data.
    base_client: BaseClient,
    /// State of the sync loop and the channels announcing its changes.
    pub(crate) sync: SyncControl,
    /// Lock making sure we're only doing one key upload at a time.
    pub(crate) key_upload_lock: Mutex<()>,
    /// Lock making sure we're only doing one key claim request at a time.
    pub(crate) key_claim_lock: Mutex<()>,
    /// Lock making sure we're only doing one key query request at a time.
    pub(crate) key_query_lock: Mutex<()>,
    /// Single-flight backwards pagination per room.
    pub(crate) scrollback_handler: Arc<DeduplicatingHandler<OwnedRoomId>>,
    pub(crate) room_update_sender: broadcast::Sender<RoomUpdate>,
    pub(crate) crypto_event_sender: broadcast::Sender<CryptoEvent>,
}

#[cfg(not(tarpaulin_include))]
impl Debug for Client {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Client")
            .field("homeserver", &self.inner.homeserver.as_str())
            .field("base_client", &self.inner.base_client)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a new [`Client`] that will use the given homeserver.
    ///
    /// # Arguments
    ///
    /// * `homeserver_url` - The homeserver that the client should connect to.
    pub async fn new(homeserver_url: Url) -> Result<Self, ClientBuildError> {
        Self::builder().homeserver_url(homeserver_url).build().await
    }

    /// Create a new [`ClientBuilder`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_parts(
        homeserver: Url,
        http_client: HttpClient,
        base_client: BaseClient,
    ) -> Self {
        let (room_update_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (crypto_event_sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        let inner = ClientInner {
            homeserver,
            http_client,
            base_client,
            sync: SyncControl::new(CHANNEL_CAPACITY),
            key_upload_lock: Mutex::new(()),
            key_claim_lock: Mutex::new(()),
            key_query_lock: Mutex::new(()),
            scrollback_handler: Arc::new(DeduplicatingHandler::new(SCROLLBACK_COOLDOWN)),
            room_update_sender,
            crypto_event_sender,
        };

        Self { inner: Arc::new(inner) }
    }

    /// The homeserver of the client.
    pub fn homeserver(&self) -> &Url {
        &self.inner.homeserver
    }

    pub(crate) fn base_client(&self) -> &BaseClient {
        &self.inner.base_client
    }

    /// The Olm machine of the client, `None` if encryption is disabled or the
    /// client isn't logged in yet.
    pub(crate) fn olm_machine(&self) -> Option<&OlmMachine> {
        self.base_client().olm_machine()
    }

    /// The default request config of the client.
    pub fn request_config(&self) -> RequestConfig {
        self.inner.http_client.request_config
    }

    /// Is the client logged in.
    pub fn logged_in(&self) -> bool {
        self.base_client().logged_in()
    }

    /// The restored session of the client.
    pub fn session(&self) -> Option<&Session> {
        self.base_client().session()
    }

    /// The user ID of the logged in user.
    pub fn user_id(&self) -> Option<&UserId> {
        self.session().map(|s| s.user_id.as_ref())
    }

    /// The device ID of the logged in device.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.session().map(|s| s.device_id.as_ref())
    }

    /// The access token of the session.
    pub fn access_token(&self) -> Option<&str> {
        self.session().map(|s| s.access_token.as_str())
    }

    /// Restore a previously logged in session.
    ///
    /// This loads the rooms and the sync token of the state store and, unless
    /// encryption is disabled, the Olm account of the crypto store. A new
    /// account is created if the crypto store holds none.
    ///
    /// # Arguments
    ///
    /// * `session` - A session that the user already has from a previous login
    ///   call.
    #[instrument(skip_all, fields(user_id = %session.user_id, device_id = %session.device_id))]
    pub async fn restore_session(&self, session: Session) -> Result<()> {
        self.base_client().restore_session(session).await?;
        debug!("Restored the session");
        Ok(())
    }

    /// The sync token of the last successful sync, used as the starting point
    /// of the next one.
    pub async fn sync_token(&self) -> Option<String> {
        self.base_client().sync_token().await
    }

    /// Get the encryption manager of the client.
    pub fn encryption(&self) -> Encryption {
        Encryption::new(self.clone())
    }

    /// Get a room the client knows about.
    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.base_client().get_room(room_id).map(|room| Room::new(self.clone(), room))
    }

    /// Get all the rooms the client knows about.
    pub fn rooms(&self) -> Vec<Room> {
        self.base_client()
            .get_rooms()
            .into_iter()
            .map(|room| Room::new(self.clone(), room))
            .collect()
    }

    /// Subscribe to the new timeline events of the rooms, as they arrive via
    /// sync or backwards pagination.
    ///
    /// Encrypted events are already decrypted or replaced by an
    /// `m.bad.encrypted` notice.
    pub fn subscribe_to_room_updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.inner.room_update_sender.subscribe()
    }

    pub(crate) fn send_room_update(&self, update: RoomUpdate) {
        if update.events.is_empty() {
            return;
        }

        // Nobody listening is fine.
        let _ = self.inner.room_update_sender.send(update);
    }

    /// Send an arbitrary request to the homeserver.
    ///
    /// # Arguments
    ///
    /// * `request` - The request that should be sent.
    ///
    /// * `config` - Overrides the default request config of the client.
    pub(crate) async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        config: Option<RequestConfig>,
    ) -> HttpResult<T> {
        self.inner
            .http_client
            .send(request, self.homeserver(), self.access_token(), config)
            .await
    }
}
