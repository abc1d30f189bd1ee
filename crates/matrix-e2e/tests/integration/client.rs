use assert_matches::assert_matches;
use matrix_e2e::{config::SyncSettings, Error, HttpError};
use matrix_e2e_test::{test_json, DEFAULT_TEST_ROOM_ID};
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use crate::{logged_in_client_with_server, mock_encryption_endpoints};

#[tokio::test]
async fn test_server_errors_are_surfaced() {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "errcode": "M_FORBIDDEN",
            "error": "Invalid access token",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let error = client.sync_once(SyncSettings::new()).await.unwrap_err();
    let api_error = error.as_client_api_error().unwrap();

    assert_eq!(api_error.status.as_u16(), 403);
    assert_eq!(api_error.errcode, "M_FORBIDDEN");
    assert_matches!(error, Error::Http(HttpError::Api(_)));
    assert!(client.sync_token().await.is_none());
}

#[tokio::test]
async fn test_rooms_after_sync() {
    let (client, _server) = crate::synced_client().await;

    let rooms = client.rooms();
    assert_eq!(rooms.len(), 1);

    let room = client.get_room(&DEFAULT_TEST_ROOM_ID).unwrap();
    assert_eq!(room.name().as_deref(), Some("room name"));
    assert_eq!(room.timeline().len(), 1);
    assert_eq!(room.prev_batch().as_deref(), Some("t392-516_47314_0_7_1_1_1_11444_1"));
    assert!(!room.is_encrypted());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sync_token_survives_a_restart() {
    use crate::{logged_in_client, mock_sync, test_client_builder};

    let dir = tempfile::tempdir().unwrap();
    let server = wiremock::MockServer::start().await;
    mock_encryption_endpoints(&server).await;
    mock_sync(&server, &*test_json::SYNC, None).await;

    let client = logged_in_client(test_client_builder(&server).sqlite_store(dir.path())).await;
    let identity = client.encryption().ed25519_key();
    let response = client.sync_once(SyncSettings::new()).await.unwrap();
    drop(client);

    let client = logged_in_client(test_client_builder(&server).sqlite_store(dir.path())).await;

    assert_eq!(client.sync_token().await, Some(response.next_batch));
    assert_eq!(client.encryption().ed25519_key(), identity);
    assert!(client.get_room(&DEFAULT_TEST_ROOM_ID).is_some());
}
