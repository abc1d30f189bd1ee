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

//! The body of a `GET /_matrix/client/r0/rooms/{roomId}/messages` response.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A `/messages` response for a backwards pagination request.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Response {
    /// The token the pagination starts from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// The token the pagination ends at, `None` if there are no more events
    /// to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    /// A list of room events, newest first.
    #[serde(default)]
    pub chunk: Vec<JsonValue>,
}
