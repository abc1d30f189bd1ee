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

use deadpool_sqlite::{CreatePoolError, InteractError, PoolError};
#[cfg(feature = "state-store")]
use matrix_e2e_base::store::StoreError as StateStoreError;
#[cfg(feature = "crypto-store")]
use matrix_e2e_crypto::CryptoStoreError;
use thiserror::Error;
use tokio::io;

/// All the errors that can occur when opening a sqlite store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpenStoreError {
    /// Failed to create the DB's parent directory.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] io::Error),

    /// Failed to create the DB pool.
    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    /// Failed to apply migrations.
    #[error("Failed to run migrations")]
    Migration(#[source] rusqlite::Error),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The task talking to the database panicked or was aborted.
    #[error("The database task failed: {0}")]
    Interact(String),

    /// Failed to prepare the database.
    #[error("Failed to prepare the database")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to load the database's version.
    #[error("Failed to load database version")]
    LoadVersion(#[source] rusqlite::Error),

    /// The version of the database is missing.
    #[error("Missing database version")]
    MissingVersion,

    /// The version of the database is invalid.
    #[error("Invalid database version")]
    InvalidVersion,
}

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("The database task failed: {0}")]
    Interact(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl From<InteractError> for Error {
    fn from(value: InteractError) -> Self {
        Self::Interact(value.to_string())
    }
}

impl From<Error> for OpenStoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Sqlite(e) => OpenStoreError::Migration(e),
            Error::Pool(e) => OpenStoreError::Pool(e),
            Error::Interact(e) => OpenStoreError::Interact(e),
            other => OpenStoreError::Database(Box::new(other)),
        }
    }
}

#[cfg(feature = "crypto-store")]
impl From<Error> for CryptoStoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Json(e) => CryptoStoreError::Serialization(e),
            other => CryptoStoreError::backend(other),
        }
    }
}

#[cfg(feature = "state-store")]
impl From<Error> for StateStoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Json(e) => StateStoreError::Json(e),
            Error::Identifier(e) => StateStoreError::Identifier(e),
            other => StateStoreError::backend(other),
        }
    }
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
