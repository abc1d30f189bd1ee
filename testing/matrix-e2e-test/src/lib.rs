// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Fixtures shared by the tests of the `matrix-e2e` crates.
//!
//! Everything in here is plain JSON so that every crate can deserialize it
//! into its own response types.

use once_cell::sync::Lazy;
use ruma::{room_id, user_id, RoomId, UserId};

mod sync_builder;
pub mod test_json;

pub use self::sync_builder::{
    InvitedRoomBuilder, JoinedRoomBuilder, LeftRoomBuilder, StateTestEvent,
    StrippedStateTestEvent, SyncResponseBuilder,
};

#[doc(hidden)]
pub mod __macro_support {
    pub use tracing_subscriber;
}

/// Create a sync timeline event from arbitrary JSON.
///
/// Forwards all arguments to [`serde_json::json`].
#[macro_export]
macro_rules! sync_timeline_event {
    ($( $tt:tt )*) => {
        ::serde_json::json!( $($tt)* )
    }
}

/// Install a `tracing` subscriber for the tests of the invoking crate.
///
/// The invoking crate needs `ctor` as a dev-dependency. The filter is read
/// from `RUST_LOG`.
#[macro_export]
macro_rules! init_tracing_for_tests {
    () => {
        #[::ctor::ctor]
        fn init_logging() {
            use $crate::__macro_support::tracing_subscriber::{
                self, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
            };

            let _ = tracing_subscriber::registry()
                .with(EnvFilter::from_default_env())
                .with(tracing_subscriber::fmt::layer().with_test_writer())
                .try_init();
        }
    };
}

pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:server.name"));
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:other.server"));
pub static CAROL: Lazy<&UserId> = Lazy::new(|| user_id!("@carol:other.server"));

/// The room ID used by the builders when none is given.
pub static DEFAULT_TEST_ROOM_ID: Lazy<&RoomId> =
    Lazy::new(|| room_id!("!SVkFJHzfwvuaIEawgC:localhost"));
