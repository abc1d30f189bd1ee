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

//! The sync loop and the state machine tracking it.
//!
//! ```text
//! Null ──► Prepared ──► Syncing ◄──► Error
//!   └──────────────────────────────► Error
//! any ───────────────────────────► Stopped
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use matrix_e2e_base::{api::sync_events, locks::Mutex as SyncMutex, RoomType};
pub use matrix_e2e_base::sync::{
    DeviceLists, InvitedRoom, JoinedRoom, LeftRoom, Rooms, SyncResponse, Timeline,
};
use matrix_e2e_common::sleep::{backoff_delay, sleep};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::{SyncSettings, SyncToken},
    http_client::ApiRequest,
    room::{RoomUpdate, TimelineDirection},
    Client, Error, Result,
};

/// How much longer than the server side timeout we wait for a `/sync`
/// response before giving up on the request.
pub(crate) const SYNC_REQUEST_TIMEOUT_BUFFER: Duration = Duration::from_secs(10);

/// The delay before retrying after the first failed sync, doubled with every
/// further failure.
const SYNC_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// The longest delay between two failed syncs.
const SYNC_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// The state of the sync loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// No sync completed yet.
    #[default]
    Null,
    /// The first sync completed, the local state was populated.
    Prepared,
    /// A sync completed and the loop keeps going.
    Syncing,
    /// The last sync failed, the next attempt happens after a delay.
    Error,
    /// The loop was stopped.
    Stopped,
}

/// Data attached to a state transition of the sync loop.
#[derive(Clone, Debug)]
pub enum SyncStateData {
    /// Nothing to report.
    None,
    /// A sync succeeded.
    Synced {
        /// The token the next sync starts from.
        next_batch: String,
    },
    /// A sync failed.
    Failed {
        /// Why the sync failed.
        error: Arc<Error>,
        /// The number of failed attempts in a row.
        failures: u32,
        /// How long the loop waits before trying again.
        retry_in: Duration,
    },
}

/// A transition of the sync loop from one state to the next.
#[derive(Clone, Debug)]
pub struct SyncStateUpdate {
    /// The new state.
    pub state: SyncState,
    /// The state before the transition.
    pub prev_state: SyncState,
    /// What caused the transition.
    pub data: SyncStateData,
}

pub(crate) struct SyncControl {
    state: SyncMutex<SyncState>,
    updates: broadcast::Sender<SyncStateUpdate>,
    stop: watch::Sender<bool>,
    retry_now: Notify,
    /// Set while the loop sleeps before retrying a failed sync.
    waiting_to_retry: AtomicBool,
}

impl SyncControl {
    pub(crate) fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        let (stop, _) = watch::channel(false);

        Self {
            state: SyncMutex::new(SyncState::Null),
            updates,
            stop,
            retry_now: Notify::new(),
            waiting_to_retry: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        *self.state.lock()
    }

    fn set_state(&self, state: SyncState, data: SyncStateData) {
        let prev_state = std::mem::replace(&mut *self.state.lock(), state);
        trace!(?prev_state, ?state, "Sync state transition");

        // Nobody listening is fine.
        let _ = self.updates.send(SyncStateUpdate { state, prev_state, data });
    }
}

impl Client {
    /// The current state of the sync loop.
    pub fn sync_state(&self) -> SyncState {
        self.inner.sync.state()
    }

    /// Subscribe to the state transitions of the sync loop.
    pub fn subscribe_to_sync_state(&self) -> broadcast::Receiver<SyncStateUpdate> {
        self.inner.sync.updates.subscribe()
    }

    /// Synchronize the client's state with the latest state on the server.
    ///
    /// The response is merged into the local room state: state events replace
    /// older ones, new timeline events are appended and encrypted events are
    /// decrypted. The sync token is only stored once the whole response was
    /// processed.
    ///
    /// Pending encryption key uploads and device list queries are sent before
    /// and after the sync request.
    ///
    /// The request isn't retried on failure, the [`Client::sync`] loop takes
    /// care of that.
    ///
    /// # Arguments
    ///
    /// * `sync_settings` - Settings for the sync call.
    #[instrument(skip(self))]
    pub async fn sync_once(&self, sync_settings: SyncSettings) -> Result<SyncResponse> {
        if !self.logged_in() {
            return Err(Error::AuthenticationRequired);
        }

        // The sync might not return for quite a while due to the timeout.
        // We'll see if there's anything crypto related to send out before we
        // sync, i.e. if we closed our client after a sync but before the
        // crypto requests were sent out.
        //
        // This will mostly be a no-op.
        if let Err(e) = self.encryption().send_outgoing_requests().await {
            warn!(error = ?e, "Error while sending outgoing E2EE requests");
        }

        let token = match sync_settings.token {
            SyncToken::Specific(ref token) => Some(token.clone()),
            SyncToken::NoToken => None,
            SyncToken::ReusePrevious => self.sync_token().await,
        };

        let request = ApiRequest::get(["sync"]).query(sync_settings.query(token.as_deref()));

        let mut request_config = self.request_config().disable_retry();
        if let Some(timeout) = sync_settings.timeout {
            request_config.timeout = timeout + SYNC_REQUEST_TIMEOUT_BUFFER;
        }

        let response: sync_events::Response = self.send(request, Some(request_config)).await?;
        let response = self.process_sync(response).await?;

        if let Err(e) = self.encryption().send_outgoing_requests().await {
            warn!(error = ?e, "Error while sending outgoing E2EE requests");
        }

        Ok(response)
    }

    async fn process_sync(&self, response: sync_events::Response) -> Result<SyncResponse> {
        let response = self.base_client().receive_sync_response(response).await?;

        for (room_id, room) in &response.rooms.join {
            self.send_room_update(RoomUpdate {
                room_id: room_id.clone(),
                room_type: RoomType::Joined,
                direction: TimelineDirection::Forward,
                events: room.timeline.events.clone(),
            });
        }

        for (room_id, room) in &response.rooms.leave {
            self.send_room_update(RoomUpdate {
                room_id: room_id.clone(),
                room_type: RoomType::Left,
                direction: TimelineDirection::Forward,
                events: room.timeline.events.clone(),
            });
        }

        Ok(response)
    }

    /// Repeatedly synchronize the client state with the server.
    ///
    /// This keeps calling [`Client::sync_once`] until [`Client::stop_sync`] is
    /// called, an in-flight request is abandoned at that point. Every
    /// transition of the loop is announced through
    /// [`Client::subscribe_to_sync_state`].
    ///
    /// A failed sync moves the loop into the [`SyncState::Error`] state and
    /// the next attempt is delayed, starting at one second and doubling with
    /// each consecutive failure up to thirty seconds.
    /// [`Client::retry_immediately`] skips the delay.
    ///
    /// Our identity and one-time keys are uploaded first if needed.
    ///
    /// # Arguments
    ///
    /// * `sync_settings` - Settings for the sync call. The token in the
    ///   settings is only used for the first sync, later ones continue from
    ///   the token of the previous response.
    #[instrument(skip_all)]
    pub async fn sync(&self, sync_settings: SyncSettings) -> Result<()> {
        if !self.logged_in() {
            return Err(Error::AuthenticationRequired);
        }

        let control = &self.inner.sync;
        control.stop.send_replace(false);
        let mut stop = control.stop.subscribe();

        if let Some(machine) = self.olm_machine() {
            if machine.should_upload_keys().await {
                if let Err(e) = self.encryption().upload_keys_impl(None, true).await {
                    warn!(error = ?e, "Couldn't upload our encryption keys before syncing");
                }
            }
        }

        let mut sync_settings = sync_settings;
        let mut prepared = false;
        let mut failures: u32 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => None,
                result = self.sync_once(sync_settings.clone()) => Some(result),
            };

            let Some(result) = result else {
                debug!("The sync loop was stopped while a request was in flight");
                break;
            };

            match result {
                Ok(response) => {
                    failures = 0;

                    let state = if prepared { SyncState::Syncing } else { SyncState::Prepared };
                    prepared = true;

                    let data = SyncStateData::Synced { next_batch: response.next_batch };
                    control.set_state(state, data);
                    sync_settings.token = SyncToken::ReusePrevious;
                }

                Err(error) => {
                    failures = failures.saturating_add(1);
                    let retry_in =
                        backoff_delay(failures, SYNC_RETRY_BASE_DELAY, SYNC_RETRY_MAX_DELAY);

                    warn!(failures, ?retry_in, "Sync failed: {error}");

                    // Register for a wake-up before announcing the failure, a
                    // listener may ask for a retry as soon as it sees it.
                    let retry_now = control.retry_now.notified();
                    tokio::pin!(retry_now);
                    retry_now.as_mut().enable();
                    control.waiting_to_retry.store(true, Ordering::SeqCst);

                    control.set_state(
                        SyncState::Error,
                        SyncStateData::Failed { error: Arc::new(error), failures, retry_in },
                    );

                    let stopped = tokio::select! {
                        biased;
                        _ = stop.wait_for(|stopped| *stopped) => true,
                        _ = &mut retry_now => {
                            debug!("Retrying the sync right away");
                            false
                        }
                        _ = sleep(retry_in) => false,
                    };

                    control.waiting_to_retry.store(false, Ordering::SeqCst);

                    if stopped {
                        break;
                    }
                }
            }
        }

        control.set_state(SyncState::Stopped, SyncStateData::None);

        Ok(())
    }

    /// Stop a running [`Client::sync`] loop.
    ///
    /// A request that is in flight is abandoned, the sync token of an
    /// abandoned request is never stored.
    pub fn stop_sync(&self) {
        self.inner.sync.stop.send_replace(true);
    }

    /// Skip the delay before the next attempt of a failing sync loop.
    ///
    /// Returns `false` if the loop isn't waiting to retry, e.g. because the
    /// retried request is already in flight. Such a call has no effect on
    /// later failures.
    pub fn retry_immediately(&self) -> bool {
        let control = &self.inner.sync;

        if control.waiting_to_retry.load(Ordering::SeqCst) {
            // Only wakes a loop that is waiting right now, no permit is kept.
            control.retry_now.notify_waiters();
            true
        } else {
            false
        }
    }
}
