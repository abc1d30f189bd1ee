use std::{collections::BTreeMap, time::Duration};

use assert_matches::assert_matches;
use matrix_e2e::{
    config::SyncSettings,
    crypto::LocalTrust,
    encryption::{CryptoEvent, KeysUploadOutcome},
    ruma::{device_id, user_id},
    Error,
};
use matrix_e2e_test::{test_json, SyncResponseBuilder};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    logged_in_client, logged_in_client_with_server, mock_encryption_endpoints, mock_keys_upload,
    mock_sync, test_client_builder, RemoteDevice,
};

#[tokio::test]
async fn test_upload_keys_tops_up_the_pool_once() {
    let server = MockServer::start().await;
    let client = logged_in_client(test_client_builder(&server).one_time_key_pool_size(20)).await;
    let upload = mock_keys_upload(&server).await;

    let mut crypto_events = client.encryption().subscribe_to_crypto_events();

    let outcome = client.encryption().upload_keys(Some(5)).await.unwrap();

    // The device keys go first, then the pool is filled up to half of its
    // size. The limit of 5 keys doesn't apply to that first round, the
    // recheck finds enough keys on the server.
    assert_eq!(
        outcome,
        KeysUploadOutcome {
            device_keys_uploaded: true,
            one_time_keys_uploaded: 10,
            server_count: 10,
        }
    );
    assert_eq!(upload.published(), 10);
    assert_eq!(upload.requests(), 2);

    assert_eq!(
        crypto_events.try_recv().unwrap(),
        CryptoEvent::OneTimeKeysUploaded { uploaded: 10, server_count: 10 }
    );

    let outcome = client.encryption().upload_keys(Some(5)).await.unwrap();

    assert!(!outcome.device_keys_uploaded);
    assert_eq!(outcome.one_time_keys_uploaded, 0);
    assert_eq!(outcome.server_count, 10);
    assert_eq!(upload.published(), 10);
    assert!(crypto_events.try_recv().is_err());
}

#[tokio::test]
async fn test_upload_keys_without_encryption() {
    let server = MockServer::start().await;
    let client = logged_in_client(test_client_builder(&server).encryption_enabled(false)).await;

    assert_matches!(client.encryption().upload_keys(None).await, Err(Error::CryptoDisabled));
    assert!(client.encryption().ed25519_key().is_none());
}

#[tokio::test]
async fn test_low_one_time_key_count_in_sync_triggers_an_upload() {
    let server = MockServer::start().await;
    let client = logged_in_client(test_client_builder(&server).one_time_key_pool_size(20)).await;
    let upload = mock_encryption_endpoints(&server).await;

    client.encryption().upload_keys(None).await.unwrap();
    assert_eq!(upload.published(), 10);

    let mut crypto_events = client.encryption().subscribe_to_crypto_events();

    // Somebody claimed most of our keys.
    let mut builder = SyncResponseBuilder::new();
    builder.set_one_time_key_count(2);
    mock_sync(&server, builder.build_json_sync_response(), None).await;

    client.sync_once(SyncSettings::new()).await.unwrap();

    assert_eq!(
        crypto_events.try_recv().unwrap(),
        CryptoEvent::OneTimeKeysUploaded { uploaded: 8, server_count: 18 }
    );
}

#[tokio::test]
async fn test_claim_one_time_keys_reports_missing_devices() {
    let (client, server) = logged_in_client_with_server().await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::KEYS_CLAIM_EMPTY))
        .expect(1)
        .mount(&server)
        .await;

    let bob = user_id!("@bob:localhost");
    let devices = BTreeMap::from([(bob.to_owned(), vec![device_id!("BOBDEVICE").to_owned()])]);

    let outcome = client.encryption().claim_one_time_keys(devices.clone()).await.unwrap();

    assert!(outcome.created.is_empty());
    assert_eq!(outcome.missing_devices, devices);
}

#[tokio::test]
async fn test_claim_one_time_keys_creates_sessions() {
    let (client, server) = logged_in_client_with_server().await;
    let bob = RemoteDevice::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;
    bob.mount(&server).await;

    let encryption = client.encryption();
    encryption.download_keys([bob.machine.user_id()], false).await.unwrap();

    let devices = BTreeMap::from([(
        bob.machine.user_id().to_owned(),
        vec![bob.machine.device_id().to_owned()],
    )]);
    let outcome = encryption.claim_one_time_keys(devices).await.unwrap();

    assert!(outcome.missing_devices.is_empty());
    assert_eq!(outcome.created[bob.machine.user_id()].len(), 1);

    let device = encryption
        .get_device(bob.machine.user_id(), bob.machine.device_id())
        .await
        .unwrap()
        .unwrap();
    assert!(device.has_olm_session().await.unwrap());
}

#[tokio::test]
async fn test_claim_finishes_when_the_caller_stops_waiting() {
    let (client, server) = logged_in_client_with_server().await;
    let bob = RemoteDevice::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bob.keys_query_response()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/claim"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(bob.keys_claim_response())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let encryption = client.encryption();
    encryption.download_keys([bob.machine.user_id()], false).await.unwrap();

    let devices = BTreeMap::from([(
        bob.machine.user_id().to_owned(),
        vec![bob.machine.device_id().to_owned()],
    )]);
    let claim = encryption.claim_one_time_keys(devices);
    assert!(tokio::time::timeout(Duration::from_millis(50), claim).await.is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;

    let device = encryption
        .get_device(bob.machine.user_id(), bob.machine.device_id())
        .await
        .unwrap()
        .unwrap();
    assert!(device.has_olm_session().await.unwrap());
}

#[tokio::test]
async fn test_download_keys_and_verify_a_device() {
    let (client, server) = logged_in_client_with_server().await;
    let bob = RemoteDevice::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;
    let bob_id = bob.machine.user_id();

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bob.keys_query_response()))
        .expect(2)
        .mount(&server)
        .await;

    let encryption = client.encryption();
    let mut crypto_events = encryption.subscribe_to_crypto_events();

    let updates = encryption.download_keys([bob_id], false).await.unwrap();
    assert_eq!(updates.new[bob_id], vec![bob.machine.device_id().to_owned()]);
    assert_eq!(encryption.tracked_users().await, vec![bob_id.to_owned()]);
    assert_eq!(crypto_events.try_recv().unwrap(), CryptoEvent::DevicesUpdated(updates));

    // The device list is up to date, only a forced download asks the server.
    assert!(encryption.download_keys([bob_id], false).await.unwrap().is_empty());
    assert!(encryption.download_keys([bob_id], true).await.unwrap().is_empty());

    let devices = encryption.get_user_devices(bob_id).await.unwrap();
    let device_ids: Vec<_> = devices.keys().cloned().collect();
    assert_eq!(device_ids, vec![bob.machine.device_id().to_owned()]);

    let device = devices.get(bob.machine.device_id()).unwrap();
    assert!(!device.is_verified());
    assert!(!device.is_blocked());

    device.verify().await.unwrap();
    assert_eq!(
        crypto_events.try_recv().unwrap(),
        CryptoEvent::DeviceTrustChanged {
            user_id: bob_id.to_owned(),
            device_id: bob.machine.device_id().to_owned(),
            trust: LocalTrust::Verified,
        }
    );

    // Setting the same state again is a no-op.
    device.verify().await.unwrap();
    assert!(crypto_events.try_recv().is_err());

    let device = encryption.get_device(bob_id, bob.machine.device_id()).await.unwrap().unwrap();
    assert!(device.is_verified());

    device.block().await.unwrap();
    let device = encryption.get_device(bob_id, bob.machine.device_id()).await.unwrap().unwrap();
    assert!(device.is_blocked());
    assert_eq!(device.local_trust_state(), LocalTrust::Blocked);
}
