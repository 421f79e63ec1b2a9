//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use folio::config::{
    AppConfig, CollectionConfig, FederationConfig, InstanceConfig, LoggingConfig, ServerConfig,
    StorageConfig, UserConfig,
};
use folio::{AppState, federation};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration for a server reachable at `domain` over plain HTTP
pub fn test_config(domain: &str, temp_dir: &TempDir) -> AppConfig {
    let mut users = BTreeMap::new();
    users.insert(
        "alice".to_string(),
        UserConfig {
            display_name: Some("Alice".to_string()),
            bio: Some("Writes things".to_string()),
        },
    );
    users.insert("bob".to_string(), UserConfig::default());

    let mut collections = BTreeMap::new();
    collections.insert("blog".to_string(), CollectionConfig::default());
    collections.insert(
        "drafts".to_string(),
        CollectionConfig {
            federate: Some(false),
            owner: None,
        },
    );

    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        instance: InstanceConfig {
            title: "Test Instance".to_string(),
            description: "Test Folio Instance".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        federation: FederationConfig {
            enabled: true,
            master_key: Some("test master key".to_string()),
            key_bits: 1024,
            allow_private_hosts: true,
            fetch_timeout_seconds: 5,
            delivery_timeout_seconds: 5,
            ..FederationConfig::default()
        },
        storage: StorageConfig {
            content_path: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        },
        users,
        collections,
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        folio::metrics::init_metrics();
        let temp_dir = TempDir::new().unwrap();

        // Bind first: the server's own address is its public domain.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = test_config(&addr.to_string(), &temp_dir);
        customize(&mut config);

        let state = AppState::new(config).await.unwrap();
        let app = folio::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_uri(&self, username: &str) -> String {
        self.state.config.actor_uri(username)
    }

    /// A fresh router over the same state, for `oneshot` requests
    pub fn router(&self) -> Router {
        folio::build_router(self.state.clone())
    }

    /// GET with an ActivityPub Accept header
    pub async fn get_activity(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("Accept", "application/activity+json")
            .send()
            .await
            .unwrap()
    }
}

/// An inbox delivery received by [`FakeRemote`]
#[derive(Debug, Clone)]
pub struct Delivery {
    pub path: String,
    pub activity: Value,
    pub signed: bool,
}

struct RemoteState {
    base: String,
    public_key_pem: String,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

/// A remote server hosting actors that share one signing key
///
/// Actors named `solo*` or `down*` have no shared inbox; inboxes of `down*`
/// actors answer 503. Actors named `gts*` publish their key as a separate
/// document at `<actor>/main-key`.
pub struct FakeRemote {
    pub base: String,
    pub private_key_pem: String,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl FakeRemote {
    pub async fn start() -> Self {
        let mut rng = rand::thread_rng();
        let private_key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let public_key_pem = rsa::RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let deliveries = Arc::new(Mutex::new(Vec::new()));

        let state = Arc::new(RemoteState {
            base: base.clone(),
            public_key_pem,
            deliveries: Arc::clone(&deliveries),
        });
        let app = Router::new()
            .route("/users/:name", get(remote_actor))
            .route("/users/:name/main-key", get(remote_actor))
            .route("/users/:name/inbox", post(remote_inbox))
            .route("/inbox", post(remote_shared_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            private_key_pem,
            deliveries,
        }
    }

    pub fn actor(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    /// Key id remote actor `name` signs with
    pub fn key_id(&self, name: &str) -> String {
        key_id_for(&self.actor(name), name)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Deliveries of one activity type
    pub fn deliveries_of(&self, kind: &str) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.activity["type"] == kind)
            .collect()
    }

    /// POST `activity` to `url`, signed as the remote actor `name`
    pub async fn post_signed(&self, url: &str, name: &str, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.post_signed_bytes(url, name, body).await
    }

    pub async fn post_signed_bytes(&self, url: &str, name: &str, body: Vec<u8>) -> reqwest::Response {
        let key_id = self.key_id(name);
        let headers =
            federation::sign_request("POST", url, &body, &self.private_key_pem, &key_id).unwrap();

        reqwest::Client::new()
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", headers.date)
            .header("Digest", headers.digest)
            .header("Signature", headers.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// Have remote actor `name` follow `local_actor` through its inbox
    pub async fn follow(&self, server: &TestServer, name: &str, username: &str) -> reqwest::Response {
        let activity = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/{}", self.actor(name), username),
            "type": "Follow",
            "actor": self.actor(name),
            "object": server.actor_uri(username),
        });
        self.post_signed(&server.url(&format!("/users/{}/inbox", username)), name, &activity)
            .await
    }
}

async fn remote_actor(
    State(state): State<Arc<RemoteState>>,
    Path(name): Path<String>,
) -> Json<Value> {
    let id = format!("{}/users/{}", state.base, name);
    let mut actor = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": name,
        "name": format!("{} (remote)", name),
        "url": format!("{}/@{}", state.base, name),
        "inbox": format!("{}/inbox", id),
        "outbox": format!("{}/outbox", id),
        "publicKey": {
            "id": key_id_for(&id, &name),
            "owner": id,
            "publicKeyPem": state.public_key_pem,
        }
    });
    if !name.starts_with("solo") && !name.starts_with("down") {
        actor["endpoints"] = json!({"sharedInbox": format!("{}/inbox", state.base)});
    }
    Json(actor)
}

fn key_id_for(actor: &str, name: &str) -> String {
    if name.starts_with("gts") {
        format!("{}/main-key", actor)
    } else {
        format!("{}#main-key", actor)
    }
}

fn record(state: &RemoteState, path: String, headers: &axum::http::HeaderMap, body: &[u8]) {
    let activity = serde_json::from_slice(body).unwrap_or(Value::Null);
    state.deliveries.lock().unwrap().push(Delivery {
        path,
        activity,
        signed: headers.contains_key("signature"),
    });
}

async fn remote_inbox(
    State(state): State<Arc<RemoteState>>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    if name.starts_with("down") {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    record(&state, format!("/users/{}/inbox", name), &headers, &body);
    StatusCode::ACCEPTED
}

async fn remote_shared_inbox(
    State(state): State<Arc<RemoteState>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    record(&state, "/inbox".to_string(), &headers, &body);
    StatusCode::ACCEPTED
}
