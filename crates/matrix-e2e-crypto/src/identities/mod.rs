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

//! Collection of public identities used in Matrix.
//!
//! Matrix supports multiple devices per user, each device has its own
//! long-term Ed25519 and Curve25519 keys. Devices are downloaded with a
//! `/keys/query` request, their self-signature is checked and a device whose
//! signing key changes is never silently replaced.
//!
//! Devices can be locally marked as verified or blocked, blocked devices are
//! skipped when messages get encrypted.

pub(crate) mod device;
pub(crate) mod manager;

pub use device::{Device, DeviceData, LocalTrust, UserDevices};
pub(crate) use manager::IdentityManager;
