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
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use backoff::{future::retry, Error as RetryError, ExponentialBackoff};
use bytes::Bytes;
use http::{header, HeaderValue, Method};
use matrix_e2e_common::AsyncTraitDeps;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, field::debug, instrument, trace, Span};
use url::Url;

use crate::{
    config::RequestConfig,
    error::{ClientApiError, HttpError, HttpResult},
};

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The prefix of every client-server API endpoint we use.
const API_PREFIX: [&str; 3] = ["_matrix", "client", "r0"];

/// Abstraction around the http layer. The allows implementors to use different
/// http libraries.
#[async_trait]
pub trait HttpSend: AsyncTraitDeps {
    /// The method abstracting sending request types and receiving response
    /// types.
    ///
    /// This is called by the client every time it wants to send anything to a
    /// homeserver.
    ///
    /// # Arguments
    ///
    /// * `request` - The http request that should be sent.
    ///
    /// * `timeout` - A timeout for the full request > response cycle.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use matrix_e2e::{async_trait, bytes::Bytes, HttpError, HttpSend};
    ///
    /// #[derive(Debug)]
    /// struct Client(reqwest::Client);
    ///
    /// #[async_trait]
    /// impl HttpSend for Client {
    ///     async fn send_request(
    ///         &self,
    ///         request: http::Request<Bytes>,
    ///         timeout: Duration,
    ///     ) -> Result<http::Response<Bytes>, HttpError> {
    ///         self.0.send_request(request, timeout).await
    ///     }
    /// }
    /// ```
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError>;
}

/// A request to a client-server API endpoint.
///
/// The path is given as segments relative to `/_matrix/client/r0`, each
/// segment gets percent-encoded on its own.
#[derive(Debug, Clone)]
pub(crate) struct ApiRequest {
    method: Method,
    path: Vec<String>,
    query: Vec<(&'static str, String)>,
    body: Option<JsonValue>,
}

impl ApiRequest {
    fn new<I, S>(method: Method, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            path: path.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn get<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::GET, path)
    }

    pub(crate) fn post<I, S>(path: I, body: JsonValue) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::POST, path).body(body)
    }

    pub(crate) fn put<I, S>(path: I, body: JsonValue) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Method::PUT, path).body(body)
    }

    pub(crate) fn query(mut self, query: impl IntoIterator<Item = (&'static str, String)>) -> Self {
        self.query.extend(query);
        self
    }

    fn body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    fn path(&self) -> String {
        self.path.join("/")
    }

    /// Turn this into an `http::Request` against the given homeserver.
    ///
    /// Every endpoint we talk to is authenticated, building fails without an
    /// access token.
    fn build(
        &self,
        homeserver: &Url,
        access_token: Option<&str>,
    ) -> HttpResult<http::Request<Bytes>> {
        let access_token = access_token.ok_or(HttpError::AuthenticationRequired)?;

        let mut url = homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(&self.path);

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        let body = match &self.body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };

        let mut builder = http::Request::builder().method(self.method.clone()).uri(url.as_str());

        if self.body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }

        let authorization =
            HeaderValue::from_str(&format!("Bearer {access_token}")).map_err(http::Error::from)?;
        builder = builder.header(header::AUTHORIZATION, authorization);

        Ok(builder.body(body)?)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    pub(crate) inner: Arc<dyn HttpSend>,
    pub(crate) request_config: RequestConfig,
    next_request_id: Arc<AtomicU64>,
}

impl HttpClient {
    pub(crate) fn new(inner: Arc<dyn HttpSend>, request_config: RequestConfig) -> Self {
        HttpClient { inner, request_config, next_request_id: AtomicU64::new(0).into() }
    }

    fn get_request_id(&self) -> String {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        format!("REQ-{request_id}")
    }

    /// Send the request and deserialize the body of a successful response.
    #[instrument(
        skip(self, request, homeserver, access_token, config),
        fields(
            method = %request.method,
            path = %request.path(),
            config,
            request_id,
            status,
            response_size,
        )
    )]
    pub(crate) async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        homeserver: &Url,
        access_token: Option<&str>,
        config: Option<RequestConfig>,
    ) -> HttpResult<T> {
        let config = config.unwrap_or(self.request_config);
        let request_id = self.get_request_id();

        let span = Span::current();
        span.record("config", debug(config)).record("request_id", request_id.as_str());

        let request = request.build(homeserver, access_token)?;

        let response = match self.send_with_retries(request, config).await {
            Ok(response) => {
                span.record("status", response.status().as_u16())
                    .record("response_size", response.body().len());
                response
            }
            Err(e) => {
                debug!("Error while sending request: {e:?}");
                return Err(e);
            }
        };

        Ok(serde_json::from_slice(response.body())?)
    }

    async fn send_with_retries(
        &self,
        request: http::Request<Bytes>,
        config: RequestConfig,
    ) -> HttpResult<http::Response<Bytes>> {
        // Without a retry limit transient failures are retried until they stop.
        let backoff = ExponentialBackoff { max_elapsed_time: None, ..Default::default() };
        let retry_count = AtomicU64::new(1);

        let retry_count = &retry_count;
        let request = &request;

        let send_request = || async move {
            let stop = if let Some(retry_limit) = config.retry_limit {
                retry_count.fetch_add(1, Ordering::Relaxed) >= retry_limit
            } else {
                false
            };

            match self.send_once(clone_request(request), config.timeout).await {
                Ok(response) => Ok(response),
                Err(error) if !stop && error.is_transient() => {
                    trace!("Transient error while sending the request, retrying: {error}");

                    match error.retry_after() {
                        Some(retry_after) => Err(RetryError::retry_after(error, retry_after)),
                        None => Err(RetryError::transient(error)),
                    }
                }
                Err(error) => Err(RetryError::Permanent(error)),
            }
        };

        retry::<_, HttpError, _, _, _>(backoff, send_request).await
    }

    /// Send the request a single time, error responses of the server are
    /// turned into a [`ClientApiError`].
    async fn send_once(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> HttpResult<http::Response<Bytes>> {
        let response = tokio::time::timeout(timeout, self.inner.send_request(request, timeout))
            .await
            .map_err(|_| HttpError::Timeout(timeout))??;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ClientApiError::from_response(response.status(), response.body()).into())
        }
    }
}

/// Settings of the default `reqwest` based HTTP client.
#[derive(Clone, Debug)]
pub(crate) struct HttpSettings {
    pub(crate) proxy: Option<String>,
    pub(crate) user_agent: Option<String>,
    pub(crate) timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { proxy: None, user_agent: None, timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

impl HttpSettings {
    /// Build a client with the specified configuration.
    pub(crate) fn make_client(&self) -> Result<reqwest::Client, HttpError> {
        let mut http_client = reqwest::Client::builder();

        if let Some(p) = &self.proxy {
            http_client = http_client.proxy(reqwest::Proxy::all(p.as_str())?);
        }

        let user_agent = self.user_agent.clone().unwrap_or_else(|| "matrix-e2e".to_owned());

        http_client = http_client.user_agent(user_agent).timeout(self.timeout);

        Ok(http_client.build()?)
    }
}

// Clones all request parts except the extensions which can't be cloned.
fn clone_request(request: &http::Request<Bytes>) -> http::Request<Bytes> {
    let mut cloned = http::Request::new(request.body().clone());
    *cloned.method_mut() = request.method().clone();
    *cloned.uri_mut() = request.uri().clone();
    *cloned.version_mut() = request.version();
    *cloned.headers_mut() = request.headers().clone();
    cloned
}

async fn response_to_http_response(
    mut response: reqwest::Response,
) -> Result<http::Response<Bytes>, HttpError> {
    let status = response.status();

    let mut http_builder = http::Response::builder().status(status);

    if let Some(headers) = http_builder.headers_mut() {
        for (k, v) in response.headers_mut().drain() {
            if let Some(key) = k {
                headers.insert(key, v);
            }
        }
    }

    let body = response.bytes().await?;

    Ok(http_builder.body(body)?)
}

#[async_trait]
impl HttpSend for reqwest::Client {
    async fn send_request(
        &self,
        request: http::Request<Bytes>,
        timeout: Duration,
    ) -> Result<http::Response<Bytes>, HttpError> {
        let mut request = reqwest::Request::try_from(request)?;
        *request.timeout_mut() = Some(timeout);

        let response = self.execute(request).await?;

        response_to_http_response(response).await
    }
}
