// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use matrix_e2e_common::locks::Mutex as SyncMutex;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::{Error, Result};

type DeduplicatedRequestMap<Key> = Mutex<BTreeMap<Key, Arc<Mutex<Result<(), ()>>>>>;

/// Handler that properly deduplicates function calls given a key uniquely
/// identifying the call kind, and will properly report error upwards in case
/// the concurrent call failed.
///
/// After a failed call, a new call for the same key only starts once the
/// cooldown passed since the failure.
pub(crate) struct DeduplicatingHandler<Key> {
    inflight: DeduplicatedRequestMap<Key>,
    last_failure: SyncMutex<BTreeMap<Key, Instant>>,
    cooldown: Duration,
}

impl<Key> DeduplicatingHandler<Key> {
    pub fn new(cooldown: Duration) -> Self {
        Self { inflight: Default::default(), last_failure: Default::default(), cooldown }
    }
}

impl<Key: Clone + Ord + std::fmt::Debug> DeduplicatingHandler<Key> {
    /// How long a new call for the key still has to wait.
    fn remaining_cooldown(&self, key: &Key) -> Option<Duration> {
        let failed_at = *self.last_failure.lock().get(key)?;
        self.cooldown.checked_sub(failed_at.elapsed()).filter(|d| !d.is_zero())
    }

    pub async fn run<'a, F: Future<Output = Result<()>> + Send + 'a>(
        &self,
        key: Key,
        code: F,
    ) -> Result<()> {
        let mut map = self.inflight.lock().await;

        if let Some(mutex) = map.get(&key).cloned() {
            // If a request is already going on, await the release of the lock.
            drop(map);

            return mutex.lock().await.map_err(|()| Error::ConcurrentRequestFailed);
        }

        // Assume a successful request; we'll modify the result in case of failures
        // later.
        let request_mutex = Arc::new(Mutex::new(Ok(())));

        map.insert(key.clone(), request_mutex.clone());

        let mut request_guard = request_mutex.lock().await;
        drop(map);

        // Callers that join us while we wait out the cooldown wait as well.
        if let Some(remaining) = self.remaining_cooldown(&key) {
            debug!(?key, ?remaining, "The previous attempt failed, waiting before trying again");
            tokio::time::sleep(remaining).await;
        }

        match code.await {
            Ok(()) => {
                self.last_failure.lock().remove(&key);
                self.inflight.lock().await.remove(&key);
                Ok(())
            }

            Err(err) => {
                self.last_failure.lock().insert(key.clone(), Instant::now());

                // Propagate the error state to other callers.
                *request_guard = Err(());

                // Remove the request from the in-flights set.
                self.inflight.lock().await.remove(&key);

                // Bubble up the error.
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use tokio::{join, sync::Mutex, task::yield_now, time::Instant};

    use super::DeduplicatingHandler;
    use crate::Error;

    const COOLDOWN: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_deduplicating_handler_same_key() -> anyhow::Result<()> {
        let num_calls = Arc::new(Mutex::new(0));

        let inner = || {
            let num_calls_cloned = num_calls.clone();
            async move {
                yield_now().await;
                *num_calls_cloned.lock().await += 1;
                yield_now().await;
                Ok(())
            }
        };

        let handler = DeduplicatingHandler::new(COOLDOWN);

        let (first, second) = join!(handler.run(0, inner()), handler.run(0, inner()));

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(*num_calls.lock().await, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_deduplicating_handler_different_keys() -> anyhow::Result<()> {
        let num_calls = Arc::new(Mutex::new(0));

        let inner = || {
            let num_calls_cloned = num_calls.clone();
            async move {
                yield_now().await;
                *num_calls_cloned.lock().await += 1;
                yield_now().await;
                Ok(())
            }
        };

        let handler = DeduplicatingHandler::new(COOLDOWN);

        let (first, second) = join!(handler.run(0, inner()), handler.run(1, inner()));

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(*num_calls.lock().await, 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_deduplicating_handler_multiple_requests_on_error() -> anyhow::Result<()> {
        let num_calls = Arc::new(Mutex::new(0));

        let inner = || {
            let num_calls_cloned = num_calls.clone();
            async move {
                yield_now().await;
                *num_calls_cloned.lock().await += 1;
                yield_now().await;
                Err(Error::AuthenticationRequired)
            }
        };

        let handler = DeduplicatingHandler::new(COOLDOWN);

        let (first, second) = join!(handler.run(0, inner()), handler.run(0, inner()));

        assert_matches!(first, Err(Error::AuthenticationRequired));
        assert_matches!(second, Err(Error::ConcurrentRequestFailed));
        assert_eq!(*num_calls.lock().await, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_cooldown_after_failure() -> anyhow::Result<()> {
        let handler = DeduplicatingHandler::new(COOLDOWN);

        let result = handler.run(0, async { Err(Error::AuthenticationRequired) }).await;
        assert!(result.is_err());

        // Other keys aren't affected by the failure.
        let start = Instant::now();
        handler.run(1, async { Ok(()) }).await?;
        assert!(start.elapsed() < COOLDOWN);

        // The failed key waits until the cooldown is over.
        handler.run(0, async { Ok(()) }).await?;
        assert!(start.elapsed() >= COOLDOWN - Duration::from_millis(20));

        // A success clears the cooldown.
        let start = Instant::now();
        handler.run(0, async { Ok(()) }).await?;
        assert!(start.elapsed() < COOLDOWN);

        Ok(())
    }
}
