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
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub use matrix_e2e_common::*;

pub use crate::error::{Error, Result};

pub mod api;
mod client;
mod error;
pub mod events;
mod rooms;
mod session;
pub mod store;
pub mod sync;

pub use client::{BaseClient, BaseClientConfig};
pub use matrix_e2e_crypto as crypto;
pub use once_cell;
pub use rooms::{Room, RoomInfo, RoomType};
pub use session::Session;
pub use store::{StateChanges, StateStore, StoreError};

#[cfg(test)]
matrix_e2e_test::init_tracing_for_tests!();
