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

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Token to be used in the next sync request.
#[derive(Clone, Default, Debug)]
pub enum SyncToken {
    /// Provide a specific token.
    Specific(String),
    /// Enforce no tokens at all, this forces a full initial sync.
    NoToken,
    /// Use a previous token if the client saw one in the past, and none
    /// otherwise.
    ///
    /// This is the default value.
    #[default]
    ReusePrevious,
}

impl<T> From<T> for SyncToken
where
    T: Into<String>,
{
    fn from(token: T) -> SyncToken {
        SyncToken::Specific(token.into())
    }
}

impl SyncToken {
    /// Convert a token that may exist into a [`SyncToken`]
    pub fn from_optional_token(maybe_token: Option<String>) -> SyncToken {
        match maybe_token {
            Some(token) => SyncToken::Specific(token),
            None => SyncToken::default(),
        }
    }
}

/// Settings for a sync call.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub(crate) filter: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) token: SyncToken,
    pub(crate) full_state: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSettings {
    /// Create new default sync settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filter: None,
            timeout: Some(DEFAULT_SYNC_TIMEOUT),
            token: SyncToken::default(),
            full_state: false,
        }
    }

    /// Set the sync token.
    ///
    /// # Arguments
    ///
    /// * `token` - The sync token that should be used for the sync call.
    #[must_use]
    pub fn token(mut self, token: impl Into<SyncToken>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the maximum time the server can wait, in milliseconds, before
    /// responding to the sync request.
    ///
    /// The request itself is abandoned locally if no response arrived ten
    /// seconds after this timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - The time the server is allowed to wait.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the ID of a filter that was uploaded to the server.
    #[must_use]
    pub fn filter(mut self, filter_id: impl Into<String>) -> Self {
        self.filter = Some(filter_id.into());
        self
    }

    /// Should the server return the full state from the start of the timeline.
    ///
    /// This does nothing if no sync token is set.
    ///
    /// # Arguments
    /// * `full_state` - A boolean deciding if the server should return the full
    ///   state or not.
    #[must_use]
    pub fn full_state(mut self, full_state: bool) -> Self {
        self.full_state = full_state;
        self
    }

    /// The query string of a `/sync` request using these settings and the
    /// given token.
    pub(crate) fn query(&self, since: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();

        if let Some(since) = since {
            query.push(("since", since.to_owned()));
        }
        if let Some(filter) = &self.filter {
            query.push(("filter", filter.clone()));
        }
        if let Some(timeout) = self.timeout {
            query.push(("timeout", timeout.as_millis().to_string()));
        }
        if self.full_state {
            query.push(("full_state", "true".to_owned()));
        }

        query
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::SyncSettings;

    #[test]
    fn test_query_string() {
        let settings =
            SyncSettings::new().timeout(Duration::from_secs(5)).filter("1").full_state(true);

        let query = settings.query(Some("s72595_4483_1934"));
        assert_eq!(
            query,
            vec![
                ("since", "s72595_4483_1934".to_owned()),
                ("filter", "1".to_owned()),
                ("timeout", "5000".to_owned()),
                ("full_state", "true".to_owned()),
            ]
        );

        let query = SyncSettings::new().query(None);
        assert_eq!(query, vec![("timeout", "30000".to_owned())]);
    }
}
