use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use matrix_e2e::{
    config::SyncSettings,
    room::TimelineDirection,
    sync::{SyncState, SyncStateData, SyncStateUpdate},
    Client,
};
use matrix_e2e_test::{
    test_json, JoinedRoomBuilder, StateTestEvent, SyncResponseBuilder, DEFAULT_TEST_ROOM_ID,
};
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use crate::{logged_in_client_with_server, mock_encryption_endpoints, mock_sync};

async fn next_state(updates: &mut broadcast::Receiver<SyncStateUpdate>) -> SyncStateUpdate {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("the sync loop didn't change its state in time")
        .unwrap()
}

fn spawn_sync(client: &Client) -> tokio::task::JoinHandle<matrix_e2e::Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.sync(SyncSettings::new().timeout(Duration::ZERO)).await })
}

#[tokio::test]
async fn test_sync_once() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;
    mock_sync(&server, &*test_json::SYNC, None).await;

    let mut room_updates = client.subscribe_to_room_updates();

    let response = client.sync_once(SyncSettings::new()).await.unwrap();

    assert_eq!(response.next_batch, "s526_47314_0_7_1_1_1_11444_1");
    assert_eq!(client.sync_token().await.as_deref(), Some("s526_47314_0_7_1_1_1_11444_1"));
    assert!(response.rooms.join.contains_key(*DEFAULT_TEST_ROOM_ID));

    let update = room_updates.try_recv().unwrap();
    assert_eq!(update.room_id, *DEFAULT_TEST_ROOM_ID);
    assert_eq!(update.direction, TimelineDirection::Forward);
    assert_eq!(update.events.len(), 1);
    assert_eq!(update.events[0].content().unwrap()["body"], "baba");
}

#[tokio::test]
async fn test_next_sync_continues_from_the_stored_token() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;
    mock_sync(&server, &*test_json::SYNC, None).await;

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(
        JoinedRoomBuilder::new(&DEFAULT_TEST_ROOM_ID).add_state_event(StateTestEvent::RoomTopic),
    );
    mock_sync(
        &server,
        builder.build_json_sync_response(),
        Some("s526_47314_0_7_1_1_1_11444_1".to_owned()),
    )
    .await;

    client.sync_once(SyncSettings::new()).await.unwrap();
    let response = client.sync_once(SyncSettings::new()).await.unwrap();

    assert_eq!(response.next_batch, builder.last_sync_token());
    assert_eq!(client.sync_token().await, Some(builder.last_sync_token()));

    let room = client.get_room(&DEFAULT_TEST_ROOM_ID).unwrap();
    assert_eq!(room.name().as_deref(), Some("room name"));
    assert!(room.topic().is_some());
}

#[tokio::test]
async fn test_duplicate_sync_response_is_skipped() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::SYNC))
        .expect(2)
        .mount(&server)
        .await;

    let mut room_updates = client.subscribe_to_room_updates();

    client.sync_once(SyncSettings::new()).await.unwrap();
    let response = client.sync_once(SyncSettings::new()).await.unwrap();

    assert!(response.rooms.join.is_empty());
    assert_eq!(client.get_room(&DEFAULT_TEST_ROOM_ID).unwrap().timeline().len(), 1);

    room_updates.try_recv().unwrap();
    assert!(room_updates.try_recv().is_err(), "the duplicate response shouldn't be announced");
}

#[tokio::test]
async fn test_sync_state_machine() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errcode": "M_UNKNOWN",
            "error": "Internal server error",
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let mut builder = SyncResponseBuilder::new();
    builder.add_joined_room(JoinedRoomBuilder::new(&DEFAULT_TEST_ROOM_ID));

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(builder.build_json_sync_response())
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    assert_eq!(client.sync_state(), SyncState::Null);

    let mut states = client.subscribe_to_sync_state();
    let task = spawn_sync(&client);

    let update = next_state(&mut states).await;
    assert_eq!((update.prev_state, update.state), (SyncState::Null, SyncState::Error));
    assert_matches!(
        update.data,
        SyncStateData::Failed { failures: 1, retry_in, .. } if retry_in == Duration::from_secs(1)
    );

    assert!(client.retry_immediately());

    let update = next_state(&mut states).await;
    assert_eq!((update.prev_state, update.state), (SyncState::Error, SyncState::Prepared));
    assert_matches!(
        update.data,
        SyncStateData::Synced { next_batch } if next_batch == builder.last_sync_token()
    );

    let update = next_state(&mut states).await;
    assert_eq!((update.prev_state, update.state), (SyncState::Prepared, SyncState::Syncing));
    assert!(!client.retry_immediately());

    client.stop_sync();

    loop {
        let update = next_state(&mut states).await;
        if update.state == SyncState::Stopped {
            break;
        }
        assert_eq!(update.state, SyncState::Syncing);
    }

    task.await.unwrap().unwrap();
    assert_eq!(client.sync_state(), SyncState::Stopped);
}

#[tokio::test]
async fn test_failed_syncs_back_off() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let mut states = client.subscribe_to_sync_state();
    let task = spawn_sync(&client);

    for (attempt, expected) in [(1, 1), (2, 2), (3, 4), (4, 8)] {
        let update = next_state(&mut states).await;

        assert_eq!(update.state, SyncState::Error);
        assert_matches!(
            update.data,
            SyncStateData::Failed { failures, retry_in, ref error }
                if failures == attempt && retry_in == Duration::from_secs(expected) => {
                assert!(error.as_client_api_error().is_some());
            }
        );

        assert!(client.retry_immediately());
    }

    client.stop_sync();

    loop {
        if next_state(&mut states).await.state == SyncState::Stopped {
            break;
        }
    }

    task.await.unwrap().unwrap();
    assert!(client.sync_token().await.is_none());
}

#[tokio::test]
async fn test_retry_request_while_a_retry_is_in_flight_is_ignored() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(502).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let mut states = client.subscribe_to_sync_state();
    let task = spawn_sync(&client);

    let update = next_state(&mut states).await;
    assert_matches!(update.data, SyncStateData::Failed { failures: 1, .. });
    assert!(client.retry_immediately());

    // The retried request is in flight, the loop isn't waiting anymore.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.sync_state(), SyncState::Error);
    assert!(!client.retry_immediately());

    let update = next_state(&mut states).await;
    assert_matches!(
        update.data,
        SyncStateData::Failed { failures: 2, retry_in, .. } if retry_in == Duration::from_secs(2)
    );
    let failed_at = Instant::now();

    let update = next_state(&mut states).await;
    assert_matches!(update.data, SyncStateData::Failed { failures: 3, .. });
    assert!(failed_at.elapsed() >= Duration::from_secs(2));

    client.stop_sync();

    loop {
        if next_state(&mut states).await.state == SyncState::Stopped {
            break;
        }
    }

    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_abandons_the_request_in_flight() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(&*test_json::SYNC)
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let mut states = client.subscribe_to_sync_state();
    let task = spawn_sync(&client);

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.stop_sync();

    let update = next_state(&mut states).await;
    assert_eq!((update.prev_state, update.state), (SyncState::Null, SyncState::Stopped));

    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    assert!(client.sync_token().await.is_none());
    assert!(client.rooms().is_empty());
}
