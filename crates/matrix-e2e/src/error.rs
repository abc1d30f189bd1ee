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

//! Error conditions.

use std::time::Duration;

use http::StatusCode;
use matrix_e2e_base::{crypto::SetRoomSettingsError, Error as BaseError, StoreError};
use matrix_e2e_crypto::{CryptoStoreError, OlmError};
use reqwest::Error as ReqwestError;
use ruma::{IdParseError, OwnedRoomId};
use serde::Deserialize;
use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Result type of the matrix-e2e crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result type of a pure HTTP request.
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// The error code the homeserver uses for missing resources.
pub(crate) const NOT_FOUND: &str = "M_NOT_FOUND";

/// The error code the homeserver uses when we are rate limited.
pub(crate) const LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";

/// An error the homeserver returned, the status code together with the
/// standard Matrix error body.
#[derive(Error, Debug, Clone)]
#[error("the server returned {status}: [{errcode}] {message}")]
pub struct ClientApiError {
    /// The HTTP status code of the response.
    pub status: StatusCode,
    /// The Matrix error code, e.g. `M_FORBIDDEN`.
    pub errcode: String,
    /// The human readable error message.
    pub message: String,
    /// How long the server wants us to wait before retrying.
    pub retry_after: Option<Duration>,
}

#[derive(Deserialize)]
struct ErrorBody {
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

impl ClientApiError {
    /// Build the error out of the status code and the body of an error
    /// response.
    ///
    /// Bodies that don't follow the Matrix error format keep the status code
    /// and use `M_UNKNOWN` as the error code.
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(body) => Self {
                status,
                errcode: body.errcode,
                message: body.error,
                retry_after: body.retry_after_ms.map(Duration::from_millis),
            },
            Err(_) => Self {
                status,
                errcode: "M_UNKNOWN".to_owned(),
                message: String::from_utf8_lossy(body).into_owned(),
                retry_after: None,
            },
        }
    }

    /// Is this a `404 M_NOT_FOUND` error.
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND && self.errcode == NOT_FOUND
    }

    /// Should the request be retried.
    ///
    /// Server errors and rate limiting are transient, everything else means
    /// the request itself was bad.
    pub fn is_transient(&self) -> bool {
        self.status.is_server_error()
            || self.status == StatusCode::TOO_MANY_REQUESTS
            || self.errcode == LIMIT_EXCEEDED
    }
}

/// An HTTP error, representing either a connection error or an error while
/// converting the raw HTTP response into a Matrix response.
#[derive(Error, Debug)]
pub enum HttpError {
    /// An error at the HTTP layer.
    #[error(transparent)]
    Reqwest(#[from] ReqwestError),

    /// The request couldn't be built.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// The URL of the request couldn't be built.
    #[error(transparent)]
    Url(#[from] UrlParseError),

    /// Queried endpoint requires authentication but was called on an anonymous
    /// client.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// The homeserver returned an error response.
    #[error(transparent)]
    Api(#[from] ClientApiError),

    /// The response body couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The request didn't finish within the local timeout.
    #[error("the request timed out after {0:?}")]
    Timeout(Duration),
}

impl HttpError {
    /// If `self` is an error response of the homeserver, returns it.
    pub fn as_client_api_error(&self) -> Option<&ClientApiError> {
        match self {
            HttpError::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Is this error worth retrying the request for.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Reqwest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            HttpError::Timeout(_) => true,
            HttpError::Api(e) => e.is_transient(),
            _ => false,
        }
    }

    /// How long the server asked us to wait before retrying.
    pub(crate) fn retry_after(&self) -> Option<Duration> {
        self.as_client_api_error().and_then(|e| e.retry_after)
    }
}

/// Internal representation of errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error doing an HTTP request.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// Queried endpoint requires authentication but was called on an anonymous
    /// client.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// End-to-end encryption support is turned off or there is no crypto
    /// store.
    #[error("end-to-end encryption is disabled for this client")]
    CryptoDisabled,

    /// The room encryption settings name an algorithm we can't encrypt with.
    #[error("unknown or unsupported encryption algorithm {0}")]
    UnknownAlgorithm(String),

    /// The room isn't known to the client.
    #[error("the room {0} isn't known to the client")]
    UnknownRoom(OwnedRoomId),

    /// An error de/serializing type for the `StateStore`
    #[error(transparent)]
    SerdeJson(#[from] JsonError),

    /// An error occurred in the crypto store.
    #[error(transparent)]
    CryptoStoreError(#[from] CryptoStoreError),

    /// An error occurred during a E2EE operation.
    #[error(transparent)]
    OlmError(#[from] OlmError),

    /// The encryption settings of a room couldn't be changed.
    #[error(transparent)]
    RoomSettings(#[from] SetRoomSettingsError),

    /// An error occurred in the state store.
    #[error(transparent)]
    StateStore(#[from] StoreError),

    /// An error encountered when trying to parse an identifier.
    #[error(transparent)]
    Identifier(#[from] IdParseError),

    /// An error from the base client.
    #[error(transparent)]
    Base(BaseError),

    /// A concurrent request to the same endpoint failed, the caller that
    /// joined it gets this error instead of the original one.
    #[error("a concurrent request failed; see logs for details")]
    ConcurrentRequestFailed,

    /// The background task running a request was cancelled or panicked.
    #[error("the background task running the request didn't finish")]
    BackgroundTaskFailed,
}

impl From<BaseError> for Error {
    fn from(error: BaseError) -> Self {
        match error {
            BaseError::AuthenticationRequired => Self::AuthenticationRequired,
            BaseError::StateStore(e) => Self::StateStore(e),
            BaseError::CryptoStore(e) => Self::CryptoStoreError(e),
            BaseError::OlmError(e) => Self::OlmError(e),
            BaseError::RoomSettings(e) => Self::RoomSettings(e),
            e => Self::Base(e),
        }
    }
}

impl From<ReqwestError> for Error {
    fn from(e: ReqwestError) -> Self {
        Error::Http(HttpError::Reqwest(e))
    }
}

impl Error {
    /// If `self` is an error response of the homeserver, returns it.
    pub fn as_client_api_error(&self) -> Option<&ClientApiError> {
        match self {
            Error::Http(e) => e.as_client_api_error(),
            _ => None,
        }
    }
}
