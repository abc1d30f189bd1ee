use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use matrix_e2e::{
    config::{RequestConfig, SyncSettings},
    crypto::{KeysUploadRequest, KeysUploadResponse, OlmMachine},
    ruma::{device_id, user_id, DeviceId, UserId},
    Client, ClientBuilder, Session,
};
use matrix_e2e_test::test_json;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use wiremock::{
    matchers::{header, method, path, path_regex, query_param, query_param_is_missing},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

mod client;
mod encryption;
mod room;
mod sync;

matrix_e2e_test::init_tracing_for_tests!();

fn test_session() -> Session {
    Session {
        access_token: "1234".to_owned(),
        user_id: user_id!("@example:localhost").to_owned(),
        device_id: device_id!("DEVICEID").to_owned(),
    }
}

/// A builder for a client talking to the given mocked server that never
/// retries failed requests.
fn test_client_builder(server: &MockServer) -> ClientBuilder {
    Client::builder()
        .homeserver_url(server.uri())
        .in_memory_store()
        .request_config(RequestConfig::new().disable_retry())
}

async fn logged_in_client(builder: ClientBuilder) -> Client {
    let client = builder.build().await.unwrap();
    client.restore_session(test_session()).await.unwrap();
    client
}

async fn logged_in_client_with_server() -> (Client, MockServer) {
    let server = MockServer::start().await;
    let client = logged_in_client(test_client_builder(&server)).await;
    (client, server)
}

/// A client that already processed the canned [`test_json::SYNC`] response.
async fn synced_client() -> (Client, MockServer) {
    let (client, server) = logged_in_client_with_server().await;
    mock_encryption_endpoints(&server).await;
    mock_sync(&server, &*test_json::SYNC, None).await;

    client.sync_once(SyncSettings::new()).await.unwrap();

    (client, server)
}

/// Mount a Mock on the given server to handle the `GET /sync` endpoint with
/// an optional `since` param that returns a 200 status code with the given
/// response body.
async fn mock_sync(server: &MockServer, response_body: impl Serialize, since: Option<String>) {
    let mut builder = Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .and(header("authorization", "Bearer 1234"));

    if let Some(since) = since {
        builder = builder.and(query_param("since", since));
    } else {
        builder = builder.and(query_param_is_missing("since"));
    }

    builder
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .mount(server)
        .await;
}

/// Mount a Mock on the given server to handle the `GET
/// /rooms/.../state/m.room.encryption` endpoint with an option whether it
/// should return an encryption event or not.
async fn mock_encryption_state(server: &MockServer, is_encrypted: bool) {
    let builder = Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/state/m\.room\.encryption$"))
        .and(header("authorization", "Bearer 1234"));

    if is_encrypted {
        builder
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(&*test_json::sync_events::ENCRYPTION_CONTENT),
            )
            .mount(server)
            .await;
    } else {
        builder
            .respond_with(ResponseTemplate::new(404).set_body_json(&*test_json::NOT_FOUND))
            .mount(server)
            .await;
    }
}

/// A `/keys/upload` endpoint that remembers how many one-time keys were
/// published and reports them back as the server side count.
#[derive(Clone, Default)]
struct KeysUploadResponder {
    published: Arc<AtomicU64>,
    requests: Arc<AtomicUsize>,
}

impl KeysUploadResponder {
    fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Respond for KeysUploadResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: JsonValue = request.body_json().unwrap_or_default();
        let uploaded = body["one_time_keys"].as_object().map_or(0, |keys| keys.len()) as u64;

        self.requests.fetch_add(1, Ordering::SeqCst);
        let count = self.published.fetch_add(uploaded, Ordering::SeqCst) + uploaded;

        ResponseTemplate::new(200)
            .set_body_json(json!({ "one_time_key_counts": { "signed_curve25519": count } }))
    }
}

async fn mock_keys_upload(server: &MockServer) -> KeysUploadResponder {
    let responder = KeysUploadResponder::default();

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/upload"))
        .and(header("authorization", "Bearer 1234"))
        .respond_with(responder.clone())
        .mount(server)
        .await;

    responder
}

/// Mount the key endpoints the sync loop talks to on its own, nobody else
/// has published any keys.
async fn mock_encryption_endpoints(server: &MockServer) -> KeysUploadResponder {
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::KEYS_QUERY_EMPTY))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::KEYS_CLAIM_EMPTY))
        .mount(server)
        .await;

    mock_keys_upload(server).await
}

/// The device of another user, with published device and one-time keys.
struct RemoteDevice {
    machine: OlmMachine,
    device_keys: JsonValue,
    one_time_keys: KeysUploadRequest,
}

impl RemoteDevice {
    async fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let machine = OlmMachine::new(user_id, device_id);
        machine.set_one_time_key_pool_size(20);

        let request = machine.device_keys_upload_request().await.unwrap().unwrap();
        let device_keys = serde_json::to_value(request.device_keys.as_ref().unwrap()).unwrap();
        machine
            .receive_keys_upload_response(&request, &KeysUploadResponse::default())
            .await
            .unwrap();

        let one_time_keys = machine.one_time_keys_upload_request(0, None).await.unwrap().unwrap();
        machine
            .receive_keys_upload_response(&one_time_keys, &KeysUploadResponse::default())
            .await
            .unwrap();

        Self { machine, device_keys, one_time_keys }
    }

    fn keys_query_response(&self) -> JsonValue {
        json!({
            "device_keys": {
                self.machine.user_id().as_str(): {
                    self.machine.device_id().as_str(): self.device_keys,
                },
            },
            "failures": {},
        })
    }

    fn keys_claim_response(&self) -> JsonValue {
        let (key_id, key) = self.one_time_keys.one_time_keys.iter().next().unwrap();

        json!({
            "one_time_keys": {
                self.machine.user_id().as_str(): {
                    self.machine.device_id().as_str(): {
                        key_id.as_str(): key,
                    },
                },
            },
            "failures": {},
        })
    }

    /// Serve the keys of this device on the `/keys/query` and `/keys/claim`
    /// endpoints.
    ///
    /// Needs to be mounted before [`mock_encryption_endpoints`], the mock
    /// that was mounted first wins.
    async fn mount(&self, server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/keys/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(self.keys_query_response()))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/keys/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(self.keys_claim_response()))
            .mount(server)
            .await;
    }
}
