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

#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations, missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use async_trait::async_trait;
pub use bytes;
pub use matrix_e2e_base::{
    deserialized_responses,
    events::RoomEncryptionEventContent,
    store::{DynStateStore, MemoryStore, StateStore},
    Room as BaseRoom, RoomInfo, RoomType, Session, StoreError,
};
pub use matrix_e2e_crypto as crypto;
#[cfg(feature = "sqlite")]
pub use matrix_e2e_sqlite::{SqliteCryptoStore, SqliteStateStore};
pub use reqwest;

mod client;
pub mod config;
mod deduplicating_handler;
pub mod encryption;
mod error;
mod http_client;
pub mod room;
pub mod sync;

pub use client::{Client, ClientBuildError, ClientBuilder};
pub use error::{ClientApiError, Error, HttpError, HttpResult, Result};
pub use http_client::HttpSend;
pub use room::Room;
pub use ruma;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

#[cfg(test)]
matrix_e2e_test::init_tracing_for_tests!();
