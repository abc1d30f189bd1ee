use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use matrix_e2e::{
    config::SyncSettings,
    room::{Room, TimelineDirection},
    ruma::{device_id, user_id},
    Client, Error, RoomEncryptionEventContent,
};
use matrix_e2e_test::{
    test_json, JoinedRoomBuilder, StateTestEvent, SyncResponseBuilder, DEFAULT_TEST_ROOM_ID,
};
use serde_json::json;
use wiremock::{
    matchers::{method, path_regex, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    logged_in_client_with_server, mock_encryption_endpoints, mock_encryption_state, mock_sync,
    synced_client, RemoteDevice,
};

/// A client that is joined to a room shared with `@bob:localhost`.
async fn client_with_shared_room(server: &MockServer, client: &Client) -> Room {
    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(*DEFAULT_TEST_ROOM_ID)
            .add_state_event(StateTestEvent::Member)
            .add_state_event(StateTestEvent::MemberAdditional),
    );
    mock_sync(server, builder.build_json_sync_response(), None).await;

    client.sync_once(SyncSettings::new()).await.unwrap();
    client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap()
}

fn mock_messages(from: &str, response: ResponseTemplate) -> Mock {
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/messages$"))
        .and(query_param("from", from))
        .and(query_param("dir", "b"))
        .respond_with(response)
}

#[tokio::test]
async fn test_enable_encryption_reports_members_without_keys() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;
    let room = client_with_shared_room(&server, &client).await;

    assert!(!room.is_encryption_enabled().await.unwrap());

    let coverage = room.enable_encryption(RoomEncryptionEventContent::olm()).await.unwrap();

    assert_eq!(coverage.missing_users, vec![user_id!("@bob:localhost").to_owned()]);
    assert!(coverage.missing_devices.is_empty());
    assert!(!coverage.is_complete());

    assert!(room.is_encryption_enabled().await.unwrap());
    assert!(room.is_encrypted());
}

#[tokio::test]
async fn test_enable_encryption_establishes_sessions() {
    let (client, server) = logged_in_client_with_server().await;
    let bob = RemoteDevice::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;
    bob.mount(&server).await;
    mock_encryption_endpoints(&server).await;

    let room = client_with_shared_room(&server, &client).await;
    let coverage = room.enable_encryption(RoomEncryptionEventContent::olm()).await.unwrap();

    assert!(coverage.is_complete());

    let device = client
        .encryption()
        .get_device(bob.machine.user_id(), bob.machine.device_id())
        .await
        .unwrap()
        .unwrap();
    assert!(device.has_olm_session().await.unwrap());
}

#[tokio::test]
async fn test_enable_encryption_rejects_unknown_algorithms() {
    let (client, _server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();

    let content: RoomEncryptionEventContent =
        serde_json::from_value(json!({ "algorithm": "m.megolm.v1.aes-sha2" })).unwrap();

    assert_matches!(
        room.enable_encryption(content).await,
        Err(Error::UnknownAlgorithm(algorithm)) if algorithm == "m.megolm.v1.aes-sha2"
    );
    assert!(!room.is_encryption_enabled().await.unwrap());
    assert!(!room.is_encrypted());
}

#[tokio::test]
async fn test_send_plaintext_message() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/send/m\.room\.message/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EVENT_ID))
        .expect(2)
        .mount(&server)
        .await;

    let content = json!({ "msgtype": "m.text", "body": "hello" });
    let event_id = room.send("m.room.message", content.clone()).await.unwrap();
    assert_eq!(event_id.as_str(), "$h29iv0s8:example.com");

    room.send("m.room.message", content.clone()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent: Vec<_> = requests.iter().filter(|r| r.method.as_str() == "PUT").collect();

    // Every message gets its own transaction id.
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].url.path(), sent[1].url.path());
    assert_eq!(sent[0].body_json::<serde_json::Value>().unwrap(), content);
}

#[tokio::test]
async fn test_send_encrypted_message() {
    let (client, server) = logged_in_client_with_server().await;
    let bob = RemoteDevice::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;
    bob.mount(&server).await;
    mock_encryption_endpoints(&server).await;
    mock_sync(&server, &*test_json::ENCRYPTED_ROOM_SYNC, None).await;

    client.sync_once(SyncSettings::new()).await.unwrap();
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();
    assert!(room.is_encryption_enabled().await.unwrap());

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/send/m\.room\.encrypted/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EVENT_ID))
        .expect(1)
        .mount(&server)
        .await;

    let event_id = room
        .send("m.room.message", json!({ "msgtype": "m.text", "body": "hi" }))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
    let content: serde_json::Value = request.body_json().unwrap();

    assert_eq!(content["algorithm"], "m.olm.v1.curve25519-aes-sha2");
    assert_eq!(content["sender_key"], client.encryption().curve25519_key().unwrap());

    let event = json!({
        "type": "m.room.encrypted",
        "event_id": event_id,
        "sender": client.user_id().unwrap(),
        "origin_server_ts": 1_000,
        "content": content,
    });

    let decrypted = bob.machine.decrypt_room_event(&event, *DEFAULT_TEST_ROOM_ID).await.unwrap();

    assert_eq!(decrypted.event_type(), Some("m.room.message"));
    assert_eq!(decrypted.event["content"]["body"], "hi");
}

#[tokio::test]
async fn test_disable_encryption_sends_plaintext() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;
    let room = client_with_shared_room(&server, &client).await;

    room.enable_encryption(RoomEncryptionEventContent::olm()).await.unwrap();
    room.disable_encryption().await.unwrap();
    assert!(!room.is_encryption_enabled().await.unwrap());
    // The room state still says the room is encrypted.
    assert!(room.is_encrypted());

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/send/m\.room\.message/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EVENT_ID))
        .expect(1)
        .mount(&server)
        .await;

    room.send("m.room.message", json!({ "msgtype": "m.text", "body": "hi" })).await.unwrap();
}

#[tokio::test]
async fn test_fetch_encryption_state() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();

    mock_encryption_state(&server, false).await;
    assert!(!room.fetch_encryption_state().await.unwrap());
    assert!(!room.is_encrypted());

    server.reset().await;
    mock_encryption_state(&server, true).await;

    assert!(room.fetch_encryption_state().await.unwrap());
    assert!(room.is_encrypted());
    assert!(room.is_encryption_enabled().await.unwrap());
}

#[tokio::test]
async fn test_scrollback_is_shared_between_callers() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();
    let mut updates = client.subscribe_to_room_updates();

    mock_messages(
        "t392-516_47314_0_7_1_1_1_11444_1",
        ResponseTemplate::new(200)
            .set_body_json(&*test_json::ROOM_MESSAGES)
            .set_delay(Duration::from_millis(200)),
    )
    .expect(1)
    .mount(&server)
    .await;

    let (first, second) = tokio::join!(room.scrollback(10), room.scrollback(10));
    first.unwrap();
    second.unwrap();

    let update = updates.try_recv().unwrap();
    assert_eq!(update.direction, TimelineDirection::Backward);
    assert_eq!(update.events.len(), 2);
    assert!(updates.try_recv().is_err());

    assert_eq!(room.prev_batch().as_deref(), Some("t47409-4357353_219380_26003_2265"));
    assert_eq!(room.timeline().len(), 3);
}

#[tokio::test]
async fn test_scrollback_stops_at_the_start_of_the_room() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();

    mock_messages(
        "t392-516_47314_0_7_1_1_1_11444_1",
        ResponseTemplate::new(200).set_body_json(&*test_json::ROOM_MESSAGES_END),
    )
    .expect(1)
    .mount(&server)
    .await;

    room.scrollback(10).await.unwrap();
    assert_eq!(room.prev_batch(), None);

    // Nothing left to fetch, no request is made.
    room.scrollback(10).await.unwrap();
}

#[tokio::test]
async fn test_scrollback_waits_after_a_failure() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();
    let from = "t392-516_47314_0_7_1_1_1_11444_1";

    mock_messages(from, ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mock_messages(from, ResponseTemplate::new(200).set_body_json(&*test_json::ROOM_MESSAGES))
        .expect(1)
        .mount(&server)
        .await;

    assert!(room.scrollback(10).await.is_err());

    let start = Instant::now();
    room.scrollback(10).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(2900));
    assert_eq!(room.timeline().len(), 3);
}

#[tokio::test]
async fn test_scrollback_finishes_when_the_caller_stops_waiting() {
    let (client, server) = synced_client().await;
    let room = client.get_room(*DEFAULT_TEST_ROOM_ID).unwrap();

    mock_messages(
        "t392-516_47314_0_7_1_1_1_11444_1",
        ResponseTemplate::new(200)
            .set_body_json(&*test_json::ROOM_MESSAGES)
            .set_delay(Duration::from_millis(300)),
    )
    .expect(1)
    .mount(&server)
    .await;

    assert!(tokio::time::timeout(Duration::from_millis(50), room.scrollback(10)).await.is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(room.prev_batch().as_deref(), Some("t47409-4357353_219380_26003_2265"));
    assert_eq!(room.timeline().len(), 3);
}
