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

use std::time::Duration;

use crate::http_client::DEFAULT_REQUEST_TIMEOUT;

/// Per-request settings of the HTTP layer.
///
/// Requests that fail with a transient error, e.g. a timeout or a 5xx
/// response, are resent with an exponential backoff. Without a retry limit
/// they are resent until they go through.
///
/// The sync loop ignores the retry limit, it disables the HTTP retries and
/// runs its own backoff between sync attempts.
///
/// # Examples
///
/// ```
/// use matrix_e2e::config::RequestConfig;
/// use std::time::Duration;
///
/// // Give up after the first failure and wait at most ten seconds for a
/// // response.
/// let request_config = RequestConfig::new()
///     .disable_retry()
///     .timeout(Duration::from_secs(10));
/// ```
#[derive(Copy, Clone, Debug)]
pub struct RequestConfig {
    pub(crate) timeout: Duration,
    pub(crate) retry_limit: Option<u64>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_REQUEST_TIMEOUT, retry_limit: None }
    }
}

impl RequestConfig {
    /// Create a `RequestConfig` with the default timeout and no retry limit.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Send requests a single time, same as a retry limit of `0`.
    #[must_use]
    pub fn disable_retry(self) -> Self {
        self.retry_limit(0)
    }

    /// How many times a failed request is resent.
    #[must_use]
    pub fn retry_limit(mut self, retry_limit: u64) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// How long a single attempt may take before it counts as failed.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
