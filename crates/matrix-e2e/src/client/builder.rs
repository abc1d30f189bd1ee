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

#[cfg(feature = "sqlite")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use matrix_e2e_base::{store::IntoStateStore, BaseClient, BaseClientConfig};
use matrix_e2e_crypto::store::{IntoCryptoStore, PickleKey};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use super::Client;
use crate::{
    config::RequestConfig,
    http_client::{HttpClient, HttpSend, HttpSettings},
    HttpError,
};

/// Builder that allows creating and configuring various parts of a
/// [`Client`].
///
/// When setting the `StateStore` it is up to the user to open/connect
/// the storage backend before client creation.
///
/// # Examples
///
/// ```
/// use matrix_e2e::Client;
/// // To pass all the request through mitmproxy set the proxy and disable SSL
/// // verification
///
/// let client_builder = Client::builder()
///     .homeserver_url("https://example.org")
///     .proxy("http://localhost:8080");
/// ```
///
/// # Example for using a custom http client
///
/// Note: setting a custom http client will ignore `user_agent` and `proxy`.
///
/// ```
/// use std::sync::Arc;
///
/// // setting up a custom http client
/// let reqwest_builder = reqwest::ClientBuilder::new().no_proxy();
///
/// let my_reqwest_client = reqwest_builder.build().unwrap();
///
/// let client_builder = matrix_e2e::Client::builder()
///     .homeserver_url("https://example.org")
///     .http_client(Arc::new(my_reqwest_client));
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    homeserver: Option<String>,
    http_settings: HttpSettings,
    custom_http_client: Option<Arc<dyn HttpSend>>,
    request_config: RequestConfig,
    base_config: BaseClientConfig,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<PathBuf>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            homeserver: None,
            http_settings: HttpSettings::default(),
            custom_http_client: None,
            request_config: Default::default(),
            base_config: BaseClientConfig::new(),
            #[cfg(feature = "sqlite")]
            sqlite_path: None,
        }
    }

    /// Set the homeserver URL to use.
    pub fn homeserver_url(mut self, url: impl AsRef<str>) -> Self {
        self.homeserver = Some(url.as_ref().to_owned());
        self
    }

    /// Set up the store configuration for a sqlite store.
    ///
    /// The state and the crypto keys are kept in two databases inside the
    /// given directory, a client created later on the same directory picks
    /// up where this one left.
    #[cfg(feature = "sqlite")]
    pub fn sqlite_store(mut self, path: impl AsRef<Path>) -> Self {
        self.sqlite_path = Some(path.as_ref().to_owned());
        self
    }

    /// Keep the state and the crypto keys in memory only.
    ///
    /// This is the default.
    pub fn in_memory_store(mut self) -> Self {
        #[cfg(feature = "sqlite")]
        {
            self.sqlite_path = None;
        }
        self.base_config = self
            .base_config
            .state_store(matrix_e2e_base::store::MemoryStore::new())
            .crypto_store(matrix_e2e_crypto::store::MemoryStore::new());
        self
    }

    /// Set a custom implementation of a `StateStore`.
    pub fn state_store(mut self, store: impl IntoStateStore) -> Self {
        self.base_config = self.base_config.state_store(store);
        self
    }

    /// Set a custom implementation of a `CryptoStore`.
    pub fn crypto_store(mut self, store: impl IntoCryptoStore) -> Self {
        self.base_config = self.base_config.crypto_store(store);
        self
    }

    /// Set the key the Olm account and sessions get encrypted with before they
    /// are handed to the crypto store.
    ///
    /// A random key is used if none is set, which only makes sense for the
    /// in-memory store.
    pub fn pickle_key(mut self, pickle_key: PickleKey) -> Self {
        self.base_config = self.base_config.pickle_key(pickle_key);
        self
    }

    /// Turn end-to-end encryption support on or off.
    ///
    /// It is on by default. Without it no Olm machine is created, encrypted
    /// events are reported as undecryptable and the key management methods
    /// fail with [`Error::CryptoDisabled`](crate::Error::CryptoDisabled).
    pub fn encryption_enabled(mut self, enabled: bool) -> Self {
        self.base_config = self.base_config.encryption_enabled(enabled);
        self
    }

    /// Limit the number of one-time keys our account holds, the server side
    /// pool gets refilled once it drops below half of it.
    pub fn one_time_key_pool_size(mut self, size: usize) -> Self {
        self.base_config = self.base_config.one_time_key_pool_size(size);
        self
    }

    /// Set the default timeout, fail and retry behavior for all HTTP requests.
    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }

    /// Set the proxy through which all the HTTP requests should go.
    ///
    /// Note, only HTTP proxies are supported.
    ///
    /// # Arguments
    ///
    /// * `proxy` - The HTTP URL of the proxy.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use matrix_e2e::Client;
    ///
    /// let client_config = Client::builder().proxy("http://localhost:8080");
    /// ```
    pub fn proxy(mut self, proxy: impl AsRef<str>) -> Self {
        self.http_settings.proxy = Some(proxy.as_ref().to_owned());
        self.custom_http_client = None;
        self
    }

    /// Set a custom HTTP user agent for the client.
    pub fn user_agent(mut self, user_agent: impl AsRef<str>) -> Self {
        self.http_settings.user_agent = Some(user_agent.as_ref().to_owned());
        self.custom_http_client = None;
        self
    }

    /// Specify an HTTP client to handle sending requests and receiving
    /// responses.
    ///
    /// Any type that implements the `HttpSend` trait can be used to send /
    /// receive `http` types.
    ///
    /// This method is mutually exclusive with [`user_agent()`][Self::user_agent]
    /// and [`proxy()`][Self::proxy].
    pub fn http_client(mut self, client: Arc<dyn HttpSend>) -> Self {
        self.custom_http_client = Some(client);
        self
    }

    /// Create a [`Client`] with the options set on this builder.
    ///
    /// # Errors
    ///
    /// This method can fail for two general reasons:
    ///
    /// * Invalid input: a missing or invalid homeserver URL or invalid proxy
    ///   URL
    /// * The sqlite store couldn't be opened
    #[instrument(skip_all, fields(homeserver = ?self.homeserver))]
    pub async fn build(self) -> Result<Client, ClientBuildError> {
        debug!("Starting to build the Client");

        let homeserver = self.homeserver.ok_or(ClientBuildError::MissingHomeserver)?;
        let homeserver = Url::parse(&homeserver)?;

        #[allow(unused_mut)]
        let mut base_config = self.base_config;

        #[cfg(feature = "sqlite")]
        if let Some(path) = &self.sqlite_path {
            debug!(?path, "Opening the sqlite stores");

            base_config = base_config
                .state_store(matrix_e2e_sqlite::SqliteStateStore::open(path).await?)
                .crypto_store(matrix_e2e_sqlite::SqliteCryptoStore::open(path).await?);
        }

        let inner_http_client: Arc<dyn HttpSend> = match self.custom_http_client {
            Some(client) => client,
            None => {
                let mut settings = self.http_settings;
                settings.timeout = self.request_config.timeout;
                Arc::new(settings.make_client()?)
            }
        };

        let http_client = HttpClient::new(inner_http_client, self.request_config);
        let base_client = BaseClient::with_config(base_config);

        debug!("Done building the Client");

        Ok(Client::from_parts(homeserver, http_client, base_client))
    }
}

/// Errors that can happen in [`ClientBuilder::build`].
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// No homeserver was configured.
    #[error("no homeserver was configured")]
    MissingHomeserver,

    /// An error encountered when trying to parse the homeserver url.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// Error building the HTTP client.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Error opening the sqlite store.
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteStore(#[from] matrix_e2e_sqlite::OpenStoreError),
}

impl From<reqwest::Error> for ClientBuildError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(HttpError::Reqwest(e))
    }
}
