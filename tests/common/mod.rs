#![allow(dead_code)]

mod fake_agent;

pub use fake_agent::{AGENT_TOKEN, FakeAgent};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use berth::auth::SecretHasher;
use berth::config::ServerConfig;
use berth::crypto::SecretBox;
use berth::server::{AppState, create_router};
use berth::store::{IdentityStore, SqliteStore, Store};
use berth::types::{OperationLog, OperationStatus, QueuedOperation};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-password";
pub const STACK: &str = "test-stack";

/// Berth running in-process against a fake agent.
pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub admin_token: String,
    pub server_id: i64,
    pub state: Arc<AppState>,
    pub agent: FakeAgent,
    pub client: reqwest::Client,
    cancel: CancellationToken,
}

impl TestServer {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let agent = FakeAgent::start(&[STACK, "prod-web", "prod-api", "staging-web"]).await;

        let mut config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        config.agent.scheme = "http".to_string();
        config.queue.dependency_poll_secs = 1;
        config.queue.reaper_interval_secs = 3600;

        let store = SqliteStore::new(config.db_path()).expect("open store");
        store.initialize().expect("initialize store");
        store.seed_permissions().expect("seed permissions");

        let hash = SecretHasher::new().hash(ADMIN_PASSWORD).expect("hash password");
        let role = store
            .create_role("admin", None, true)
            .expect("create admin role");
        let admin = store
            .create_user(ADMIN_USER, "admin@localhost", &hash)
            .expect("create admin");
        store.assign_role(admin.id, role.id).expect("assign admin role");

        let secrets = SecretBox::from_base64(&SecretBox::generate_key()).expect("secret box");
        let cancel = CancellationToken::new();
        let state = Arc::new(
            AppState::new(Arc::new(store), config, secrets, cancel.clone()).expect("app state"),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
        let app = create_router(state.clone());
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .expect("serve");
        });

        let client = reqwest::Client::new();
        let admin_token = login(&client, &base_url, ADMIN_USER, ADMIN_PASSWORD).await;

        let mut server = Self {
            temp_dir,
            base_url,
            admin_token,
            server_id: 0,
            state,
            agent,
            client,
            cancel,
        };
        let resp = server
            .post(
                "/api/v1/admin/servers",
                &server.admin_token.clone(),
                json!({
                    "name": "agent-1",
                    "host": "127.0.0.1",
                    "port": server.agent.port,
                    "access_token": AGENT_TOKEN,
                }),
            )
            .await;
        assert_eq!(resp.0, 201, "register server: {}", resp.1);
        server.server_id = resp.1["data"]["id"].as_i64().expect("server id");
        server
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str, token: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .expect("send");
        into_parts(resp).await
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("send");
        into_parts(resp).await
    }

    pub async fn post_anonymous(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("send");
        into_parts(resp).await
    }

    pub fn operations_path(&self, stack: &str) -> String {
        format!("/api/v1/servers/{}/stacks/{stack}/operations", self.server_id)
    }

    /// Creates a user holding one role with the given stack grants and
    /// returns `(user_id, access_token)`.
    pub async fn create_user_with_grants(
        &self,
        username: &str,
        grants: &[(&str, &str)],
    ) -> (i64, String) {
        let (status, role) = self
            .post(
                "/api/v1/admin/roles",
                &self.admin_token,
                json!({ "name": format!("{username}-role") }),
            )
            .await;
        assert_eq!(status, 201, "create role: {role}");
        let role_id = role["data"]["id"].as_i64().expect("role id");

        for (permission, pattern) in grants {
            let (status, body) = self
                .post(
                    &format!("/api/v1/admin/roles/{role_id}/stack-permissions"),
                    &self.admin_token,
                    json!({
                        "server_id": self.server_id,
                        "permission": permission,
                        "stack_pattern": pattern,
                    }),
                )
                .await;
            assert_eq!(status, 201, "grant {permission}: {body}");
        }

        let password = "user-password";
        let (status, user) = self
            .post(
                "/api/v1/admin/users",
                &self.admin_token,
                json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": password,
                    "role_ids": [role_id],
                }),
            )
            .await;
        assert_eq!(status, 201, "create user: {user}");
        let user_id = user["data"]["id"].as_i64().expect("user id");

        let token = login(&self.client, &self.base_url, username, password).await;
        (user_id, token)
    }

    /// Polls the queue row until it reaches a terminal status.
    pub async fn wait_for_terminal(&self, operation_id: &str) -> QueuedOperation {
        for _ in 0..200 {
            if let Some(row) = self
                .state
                .store
                .get_queued_operation(operation_id)
                .expect("load queued operation")
            {
                if row.status.is_terminal() {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("operation {operation_id} did not finish");
    }

    /// Polls the operation log until it holds at least `count` messages.
    pub async fn wait_for_messages(&self, operation_id: &str, count: usize) {
        for _ in 0..200 {
            if let Some(log) = self
                .state
                .store
                .get_operation_log_by_operation_id(operation_id)
                .expect("load log")
            {
                let messages = self
                    .state
                    .store
                    .list_operation_messages(log.id)
                    .expect("load messages");
                if messages.len() >= count {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("operation {operation_id} never logged {count} messages");
    }

    pub fn ws_url(&self, path: &str, token: &str) -> String {
        format!(
            "{}{path}?token={token}",
            self.base_url.replacen("http://", "ws://", 1)
        )
    }

    pub fn log(&self, operation_id: &str) -> OperationLog {
        self.state
            .store
            .get_operation_log_by_operation_id(operation_id)
            .expect("load log")
            .expect("log exists")
    }

    pub fn status_of(&self, operation_id: &str) -> OperationStatus {
        self.state
            .store
            .get_queued_operation(operation_id)
            .expect("load queued operation")
            .expect("queued operation exists")
            .status
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn login(client: &reqwest::Client, base_url: &str, username: &str, password: &str) -> String {
    let resp: Value = client
        .post(format!("{base_url}/api/v1/auth/login"))
        .json(&json!({ "username": username, "password": password }))
        .send()
        .await
        .expect("login")
        .json()
        .await
        .expect("parse login response");
    resp["data"]["access_token"]
        .as_str()
        .unwrap_or_else(|| panic!("login failed: {resp}"))
        .to_string()
}

async fn into_parts(resp: reqwest::Response) -> (u16, Value) {
    let status = resp.status().as_u16();
    let text = resp.text().await.expect("read body");
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    (status, body)
}
