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

/// Generate the store tests for a `CryptoStore` implementation.
///
/// The invoking module needs an `async fn get_store(name: &str)` returning
/// the store under test, every test passes a unique name.
#[allow(unused_macros)]
#[macro_export]
macro_rules! cryptostore_integration_tests {
    () => {
        mod cryptostore_integration_tests {
            use std::sync::Arc;

            use ruma::{device_id, room_id, user_id, DeviceId, OwnedUserId, UserId};
            use $crate::{
                store::{CryptoStore, PickleKey, RoomSettings},
                types::EventEncryptionAlgorithm,
                OlmMachine,
            };

            use super::get_store;

            fn alice_id() -> &'static UserId {
                user_id!("@alice:example.org")
            }

            fn alice_device_id() -> &'static DeviceId {
                device_id!("ALICEDEVICE")
            }

            #[tokio::test]
            async fn test_account_saving() {
                let store = get_store("account_saving").await;

                assert!(store.load_account(alice_device_id()).await.unwrap().is_none());

                store.save_account(alice_device_id(), "first".to_owned()).await.unwrap();
                store.save_account(alice_device_id(), "second".to_owned()).await.unwrap();

                assert_eq!(
                    store.load_account(alice_device_id()).await.unwrap().as_deref(),
                    Some("second")
                );
                assert!(store.load_account(device_id!("OTHERDEVICE")).await.unwrap().is_none());
            }

            #[tokio::test]
            async fn test_sessions_saving() {
                let store = get_store("sessions_saving").await;
                let sender_key = "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc";

                assert!(store.get_sessions(sender_key).await.unwrap().is_none());

                store.save_sessions(sender_key, r#"{"a":1}"#.to_owned()).await.unwrap();
                store.save_sessions(sender_key, r#"{"a":1,"b":2}"#.to_owned()).await.unwrap();

                assert_eq!(
                    store.get_sessions(sender_key).await.unwrap().as_deref(),
                    Some(r#"{"a":1,"b":2}"#)
                );
                assert!(store.get_sessions("other key").await.unwrap().is_none());
            }

            #[tokio::test]
            async fn test_user_devices_saving() {
                let store = get_store("user_devices_saving").await;

                assert!(store.get_user_devices(alice_id()).await.unwrap().is_none());
                store.save_user_devices(alice_id(), "{}".to_owned()).await.unwrap();
                assert_eq!(store.get_user_devices(alice_id()).await.unwrap().as_deref(), Some("{}"));
            }

            #[tokio::test]
            async fn test_room_settings_saving() {
                let store = get_store("room_settings_saving").await;
                let room_id = room_id!("!test:localhost");

                assert!(store.get_room_settings(room_id).await.unwrap().is_none());

                store.save_room_settings(room_id, "settings".to_owned()).await.unwrap();
                assert_eq!(
                    store.get_room_settings(room_id).await.unwrap().as_deref(),
                    Some("settings")
                );

                store.remove_room_settings(room_id).await.unwrap();
                assert!(store.get_room_settings(room_id).await.unwrap().is_none());
            }

            #[tokio::test]
            async fn test_tracked_users_saving() {
                let store = get_store("tracked_users_saving").await;

                assert!(store.load_tracked_users().await.unwrap().is_none());
                store.save_tracked_users("[]".to_owned()).await.unwrap();
                assert_eq!(store.load_tracked_users().await.unwrap().as_deref(), Some("[]"));
            }

            #[tokio::test]
            async fn test_machine_survives_a_restart() {
                let store = Arc::new(get_store("machine_restart").await);
                let pickle_key = PickleKey::new();
                let room_id = room_id!("!test:localhost");

                let machine = OlmMachine::with_store(
                    alice_id(),
                    alice_device_id(),
                    store.clone(),
                    pickle_key.clone(),
                )
                .await
                .unwrap();
                let identity_keys = machine.identity_keys();

                machine
                    .set_room_settings(room_id, &RoomSettings::olm(vec![alice_id().to_owned()]))
                    .await
                    .unwrap();
                machine.update_tracked_users([alice_id()]).await.unwrap();
                drop(machine);

                let machine = OlmMachine::with_store(
                    alice_id(),
                    alice_device_id(),
                    store.clone(),
                    pickle_key.clone(),
                )
                .await
                .unwrap();

                assert_eq!(machine.identity_keys(), identity_keys);
                assert_eq!(
                    machine.room_settings(room_id).await.unwrap().map(|s| s.algorithm),
                    Some(EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
                );
                let tracked: Vec<OwnedUserId> = machine.tracked_users().await;
                assert_eq!(tracked, vec![alice_id().to_owned()]);

                let wrong_key =
                    OlmMachine::with_store(alice_id(), alice_device_id(), store, PickleKey::new())
                        .await;
                assert!(wrong_key.is_err());
            }

            #[tokio::test]
            async fn test_account_of_other_user_is_rejected() {
                let store = Arc::new(get_store("mismatched_account").await);
                let pickle_key = PickleKey::new();

                OlmMachine::with_store(alice_id(), alice_device_id(), store.clone(), pickle_key.clone())
                    .await
                    .unwrap();

                let result = OlmMachine::with_store(
                    user_id!("@mallory:example.org"),
                    alice_device_id(),
                    store,
                    pickle_key,
                )
                .await;

                assert!(result.is_err());
            }
        }
    };
}
