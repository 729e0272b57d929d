mod common;

use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use berth::audit::RequestMeta;
use berth::error::Error;
use berth::rbac::Principal;
use berth::store::NewOperationLog;
use berth::types::{MessageType, OperationRequest, OperationStatus, QueuedOperation};
use common::{STACK, TestServer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_envelope(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(10), socket.next())
            .await
            .expect("envelope before timeout")
            .expect("socket still open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("json envelope");
        }
    }
}

/// Reads envelopes up to and including `complete` (or an `error`).
async fn until_complete(socket: &mut Socket) -> Vec<Value> {
    let mut envelopes = Vec::new();
    loop {
        let envelope = next_envelope(socket).await;
        let done = envelope["type"] == "complete" || envelope["type"] == "error";
        envelopes.push(envelope);
        if done {
            return envelopes;
        }
    }
}

fn kinds(envelopes: &[Value]) -> Vec<&str> {
    envelopes
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect()
}

fn lines(envelopes: &[Value]) -> Vec<&str> {
    envelopes
        .iter()
        .filter(|e| e["type"] == "stream_data")
        .map(|e| e["data"]["data"].as_str().unwrap())
        .collect()
}

#[tokio::test]
async fn test_health_and_login() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let (status, me) = server.get("/api/v1/auth/me", &server.admin_token).await;
    assert_eq!(status, 200);
    assert_eq!(me["data"]["username"], "admin");
    assert_eq!(me["data"]["is_admin"], true);

    let (status, _) = server.get("/api/v1/auth/me", "brs_not-a-session").await;
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_operation_happy_path() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path(STACK),
            &server.admin_token,
            json!({ "command": "up", "options": ["-d"] }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["positionInQueue"], 1);

    let row = server.wait_for_terminal(&operation_id).await;
    assert_eq!(row.status, OperationStatus::Completed);

    let log = server.log(&operation_id);
    assert_eq!(log.status, OperationStatus::Completed);
    assert_eq!(log.success, Some(true));
    assert_eq!(log.exit_code, Some(0));
    assert!(log.duration_ms.unwrap() >= 0);
    assert_eq!(log.options, r#"["-d"]"#);

    let messages = server.state.store.list_operation_messages(log.id).unwrap();
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(messages[3].message_type, MessageType::Complete);
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.message_type == MessageType::Complete)
            .count(),
        1
    );

    let (status, body) = server
        .get(
            &format!("/api/v1/operation-logs/{operation_id}"),
            &server.admin_token,
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["messages"].as_array().unwrap().len(), 4);

    let launched = server.agent.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].command, "up");
}

#[tokio::test]
async fn test_rbac_denial_is_audited() {
    let server = TestServer::start().await;
    let (user_id, token) = server
        .create_user_with_grants("reader", &[("stacks.read", "*")])
        .await;

    let (status, _) = server
        .post(
            &server.operations_path(STACK),
            &token,
            json!({ "command": "restart" }),
        )
        .await;
    assert_eq!(status, 403);
    assert!(server.agent.launched().is_empty());

    let (status, audit) = server
        .get(
            "/api/v1/admin/audit-logs?event_type=authorization_denied",
            &server.admin_token,
        )
        .await;
    assert_eq!(status, 200);
    let rows = audit["data"].as_array().unwrap();
    assert!(!rows.is_empty());
    assert_eq!(rows[0]["actor_user_id"], user_id);
    assert_eq!(rows[0]["stack_name"], STACK);

    // Reading is still allowed.
    let (status, perms) = server
        .get(
            &format!(
                "/api/v1/servers/{}/stacks/{STACK}/permissions",
                server.server_id
            ),
            &token,
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(perms["data"]["permissions"], json!(["stacks.read"]));
}

#[tokio::test]
async fn test_hidden_server_is_not_found() {
    let server = TestServer::start().await;
    let (_, token) = server.create_user_with_grants("nobody", &[]).await;

    let (status, _) = server
        .get(&format!("/api/v1/servers/{}/stacks", server.server_id), &token)
        .await;
    assert_eq!(status, 404);

    let (status, servers) = server.get("/api/v1/servers", &token).await;
    assert_eq!(status, 200);
    assert!(servers["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_stack_listing_is_filtered() {
    let server = TestServer::start().await;
    let (_, token) = server
        .create_user_with_grants("prod-reader", &[("stacks.read", "prod-*")])
        .await;

    let (status, stacks) = server
        .get(&format!("/api/v1/servers/{}/stacks", server.server_id), &token)
        .await;
    assert_eq!(status, 200);
    let names: Vec<&str> = stacks["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["prod-web", "prod-api"]);
}

#[tokio::test]
async fn test_api_key_scope_cannot_widen() {
    let server = TestServer::start().await;
    let (_, token) = server
        .create_user_with_grants("deployer", &[("stacks.manage", "*"), ("stacks.read", "*")])
        .await;

    let (status, created) = server
        .post(
            "/api/v1/api-keys",
            &token,
            json!({
                "name": "ci",
                "scopes": [{
                    "server_id": server.server_id,
                    "stack_pattern": "*",
                    "permission": "stacks.read",
                }],
            }),
        )
        .await;
    assert_eq!(status, 201, "{created}");
    let api_key = created["data"]["api_key"].as_str().unwrap().to_string();
    assert!(api_key.starts_with("brth_"));

    let (status, _) = server
        .post(
            &server.operations_path(STACK),
            &api_key,
            json!({ "command": "up" }),
        )
        .await;
    assert_eq!(status, 403);

    let (status, _) = server
        .get(
            &format!("/api/v1/servers/{}/stacks/{STACK}", server.server_id),
            &api_key,
        )
        .await;
    assert_eq!(status, 200);

    // A grant the owner does not hold is refused outright.
    let (status, _) = server
        .post(
            "/api/v1/api-keys",
            &token,
            json!({
                "name": "too-wide",
                "scopes": [{
                    "server_id": server.server_id,
                    "stack_pattern": "*",
                    "permission": "files.write",
                }],
            }),
        )
        .await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_api_key_cannot_mint_credentials() {
    let server = TestServer::start().await;
    let (_, token) = server
        .create_user_with_grants("minter", &[("stacks.manage", "*"), ("stacks.read", "*")])
        .await;

    let (status, created) = server
        .post(
            "/api/v1/api-keys",
            &token,
            json!({
                "name": "read-only",
                "scopes": [{
                    "server_id": server.server_id,
                    "stack_pattern": "*",
                    "permission": "stacks.read",
                }],
            }),
        )
        .await;
    assert_eq!(status, 201, "{created}");
    let key_id = created["data"]["metadata"]["id"].as_i64().unwrap();
    let api_key = created["data"]["api_key"].as_str().unwrap().to_string();

    let manage_scope = json!({
        "server_id": server.server_id,
        "stack_pattern": "*",
        "permission": "stacks.manage",
    });
    let (status, _) = server
        .post(
            "/api/v1/api-keys",
            &api_key,
            json!({ "name": "escalated", "scopes": [manage_scope.clone()] }),
        )
        .await;
    assert_eq!(status, 403);

    let (status, _) = server
        .post(&format!("/api/v1/api-keys/{key_id}/scopes"), &api_key, manage_scope)
        .await;
    assert_eq!(status, 403);

    let (status, _) = server
        .post(
            "/api/v1/webhooks",
            &api_key,
            json!({
                "name": "side-door",
                "stack_pattern": "*",
                "server_ids": [server.server_id],
            }),
        )
        .await;
    assert_eq!(status, 403);

    let (status, keys) = server.get("/api/v1/api-keys", &api_key).await;
    assert_eq!(status, 200);
    assert_eq!(keys["data"].as_array().unwrap().len(), 1);
    let (status, _) = server.get("/api/v1/webhooks", &token).await;
    assert_eq!(status, 200);

    let (status, _) = server
        .post(&server.operations_path(STACK), &api_key, json!({ "command": "up" }))
        .await;
    assert_eq!(status, 403);
    assert!(server.agent.launched().is_empty());
}

#[tokio::test]
async fn test_start_operation_launches_without_queueing() {
    let server = TestServer::start().await;
    let (reader_id, _) = server
        .create_user_with_grants("watcher", &[("stacks.read", "*")])
        .await;
    let admin = server
        .state
        .store
        .get_user_by_username("admin")
        .unwrap()
        .unwrap();
    let target = server
        .state
        .store
        .get_server(server.server_id)
        .unwrap()
        .unwrap();
    let request = OperationRequest {
        command: "pull".to_string(),
        options: vec![],
        services: vec!["web".to_string()],
    };
    let meta = RequestMeta::default();

    let reader = Principal::Session {
        user_id: reader_id,
        session_id: 0,
    };
    let denied = server
        .state
        .operations
        .start_operation(&server.state.cancel, &reader, &target, STACK, &request, &meta)
        .await;
    assert!(matches!(denied, Err(Error::Forbidden(_))), "{denied:?}");
    assert!(server.agent.launched().is_empty());

    let admin = Principal::Session {
        user_id: admin.id,
        session_id: 0,
    };
    let agent_operation_id = server
        .state
        .operations
        .start_operation(&server.state.cancel, &admin, &target, STACK, &request, &meta)
        .await
        .unwrap();

    let launched = server.agent.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].agent_id, agent_operation_id);
    assert_eq!(launched[0].command, "pull");

    let (status, queue) = server
        .get(
            &format!("/api/v1/servers/{}/stacks/{STACK}/queue", server.server_id),
            &server.admin_token,
        )
        .await;
    assert_eq!(status, 200);
    assert!(queue["data"].as_array().unwrap().is_empty());
    assert!(
        server
            .state
            .store
            .get_operation_log_by_operation_id(&agent_operation_id)
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_agent_disconnect_fails_operation() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path(STACK),
            &server.admin_token,
            json!({ "command": "drop" }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();

    let row = server.wait_for_terminal(&operation_id).await;
    assert_eq!(row.status, OperationStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("operation did not complete"));

    let log = server.log(&operation_id);
    assert_eq!(log.status, OperationStatus::Failed);
    assert_eq!(log.success, Some(false));
    assert_eq!(log.exit_code, None);
    let messages = server.state.store.list_operation_messages(log.id).unwrap();
    let types: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(
        types,
        vec![MessageType::Stdout, MessageType::Error, MessageType::Complete]
    );
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_shutdown_records_cancelled_operation_as_failed() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path(STACK),
            &server.admin_token,
            json!({ "command": "hang" }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();
    server.wait_for_messages(&operation_id, 1).await;

    server.state.cancel.cancel();

    let row = server.wait_for_terminal(&operation_id).await;
    assert_eq!(row.status, OperationStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("cancelled"));

    let log = server.log(&operation_id);
    assert_eq!(log.status, OperationStatus::Failed);
    assert_eq!(log.success, Some(false));
    let messages = server.state.store.list_operation_messages(log.id).unwrap();
    let types: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(
        types,
        vec![MessageType::Stdout, MessageType::Error, MessageType::Complete]
    );
    assert_eq!(messages[1].data, "operation cancelled");
}

#[tokio::test]
async fn test_websocket_submit_and_follow() {
    let server = TestServer::start().await;
    let url = server.ws_url(
        &format!("/ws/api/servers/{}/stacks/{STACK}/operations", server.server_id),
        &server.admin_token,
    );
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    let request = json!({ "type": "operation_request", "data": { "command": "up" } });
    socket
        .send(Message::text(request.to_string()))
        .await
        .unwrap();

    let started = next_envelope(&mut socket).await;
    assert_eq!(started["type"], "operation_started", "{started}");
    let operation_id = started["data"]["operationId"].as_str().unwrap().to_string();

    let envelopes = until_complete(&mut socket).await;
    assert_eq!(
        kinds(&envelopes),
        vec!["stream_data", "stream_data", "stream_data", "complete"]
    );
    assert_eq!(lines(&envelopes), vec!["up step 1", "up step 2", "up step 3"]);
    assert_eq!(envelopes[3]["data"]["success"], true);
    assert_eq!(envelopes[3]["data"]["exitCode"], 0);

    assert_eq!(
        server.wait_for_terminal(&operation_id).await.status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn test_websocket_attach_catches_up_from_log() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path(STACK),
            &server.admin_token,
            json!({ "command": "slow" }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let operation_id = body["data"]["operationId"].as_str().unwrap().to_string();
    let attach = server.ws_url(
        &format!(
            "/ws/api/servers/{}/stacks/{STACK}/operations/{operation_id}",
            server.server_id
        ),
        &server.admin_token,
    );

    // The first line is already logged when the client attaches.
    server.wait_for_messages(&operation_id, 1).await;
    let (mut socket, _) = connect_async(attach.as_str()).await.unwrap();
    let envelopes = until_complete(&mut socket).await;
    assert_eq!(
        lines(&envelopes),
        vec!["slow step 1", "slow step 2", "slow step 3"]
    );
    assert_eq!(kinds(&envelopes).last(), Some(&"complete"));
    assert_eq!(envelopes.last().unwrap()["data"]["success"], true);

    // Attaching after the fact replays everything from the log.
    server.wait_for_terminal(&operation_id).await;
    let (mut socket, _) = connect_async(attach.as_str()).await.unwrap();
    let replayed = until_complete(&mut socket).await;
    assert_eq!(
        kinds(&replayed),
        vec!["stream_data", "stream_data", "stream_data", "complete"]
    );
    assert_eq!(replayed[3]["data"]["success"], true);
    assert_eq!(replayed[3]["data"]["exitCode"], 0);
}

#[tokio::test]
async fn test_batch_runs_in_order() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path("prod-web"),
            &server.admin_token,
            json!({ "operations": [{ "command": "pull" }, { "command": "up", "options": ["-d"] }] }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let members = body["data"]["operations"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    let first = members[0]["operationId"].as_str().unwrap().to_string();
    let second = members[1]["operationId"].as_str().unwrap().to_string();
    assert_eq!(members[1]["dependsOn"], first.as_str());
    assert_eq!(members[1]["order"], 1);

    assert_eq!(
        server.wait_for_terminal(&second).await.status,
        OperationStatus::Completed
    );
    assert_eq!(server.status_of(&first), OperationStatus::Completed);
    assert!(server.log(&second).start_time >= server.log(&first).end_time.unwrap());

    let commands: Vec<String> = server
        .agent
        .launched()
        .into_iter()
        .map(|op| op.command)
        .collect();
    assert_eq!(commands, vec!["pull", "up"]);
}

#[tokio::test]
async fn test_batch_failure_cancels_dependents() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            &server.operations_path("prod-api"),
            &server.admin_token,
            json!({ "operations": [{ "command": "fail" }, { "command": "up" }] }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let first = body["data"]["operations"][0]["operationId"]
        .as_str()
        .unwrap()
        .to_string();
    let second = body["data"]["operations"][1]["operationId"]
        .as_str()
        .unwrap()
        .to_string();

    let skipped = server.wait_for_terminal(&second).await;
    assert_eq!(skipped.status, OperationStatus::Cancelled);
    assert_eq!(server.status_of(&first), OperationStatus::Failed);
    assert_eq!(server.log(&first).exit_code, Some(1));

    let skipped_log = server.log(&second);
    assert_eq!(skipped_log.status, OperationStatus::Cancelled);
    let messages = server
        .state
        .store
        .list_operation_messages(skipped_log.id)
        .unwrap();
    assert_eq!(messages.last().unwrap().message_type, MessageType::Complete);

    assert_eq!(server.agent.launched().len(), 1);
}

#[tokio::test]
async fn test_same_stack_operations_never_overlap() {
    let server = TestServer::start().await;
    let path = server.operations_path(STACK);

    let (a, b) = tokio::join!(
        server.post(&path, &server.admin_token, json!({ "command": "restart" })),
        server.post(&path, &server.admin_token, json!({ "command": "restart" })),
    );
    assert_eq!(a.0, 200);
    assert_eq!(b.0, 200);
    let ids = [
        a.1["data"]["operationId"].as_str().unwrap().to_string(),
        b.1["data"]["operationId"].as_str().unwrap().to_string(),
    ];
    for id in &ids {
        assert_eq!(
            server.wait_for_terminal(id).await.status,
            OperationStatus::Completed
        );
    }

    let mut logs: Vec<_> = ids.iter().map(|id| server.log(id)).collect();
    logs.sort_by_key(|log| log.start_time);
    assert!(logs[1].start_time >= logs[0].end_time.unwrap());
    assert_eq!(server.agent.max_concurrent(STACK), 1);
}

#[tokio::test]
async fn test_stale_operation_is_reaped_and_queue_resumes() {
    let server = TestServer::start().await;
    let store = &server.state.store;
    let admin = store.get_user_by_username("admin").unwrap().unwrap();
    let long_ago = Utc::now() - Duration::hours(1);

    let row = |operation_id: &str, status, queued_at| QueuedOperation {
        id: 0,
        operation_id: operation_id.to_string(),
        user_id: admin.id,
        server_id: server.server_id,
        stack_name: STACK.to_string(),
        command: "up".to_string(),
        options: "[]".to_string(),
        services: "[]".to_string(),
        status,
        priority: 0,
        batch_id: None,
        order_index: 0,
        depends_on: None,
        webhook_id: None,
        queued_at,
        started_at: None,
        completed_at: None,
        error: None,
    };

    let crashed = row("op_crashed", OperationStatus::Running, long_ago);
    store.create_queued_operation(&crashed).unwrap();
    store
        .create_operation_log(&NewOperationLog::from_queued(&crashed, long_ago))
        .unwrap();
    store
        .create_queued_operation(&row(
            "op_waiting",
            OperationStatus::Queued,
            long_ago + Duration::minutes(1),
        ))
        .unwrap();

    assert_eq!(server.state.queue.reap_stale().unwrap(), 1);
    let reaped = server.log("op_crashed");
    assert_eq!(reaped.status, OperationStatus::Failed);
    assert_eq!(reaped.success, Some(false));
    let queued = store.get_queued_operation("op_crashed").unwrap().unwrap();
    assert_eq!(queued.status, OperationStatus::Failed);
    assert_eq!(queued.error.as_deref(), Some("no heartbeat after restart"));

    assert_eq!(server.state.queue.replay().await.unwrap(), 1);
    assert_eq!(
        server.wait_for_terminal("op_waiting").await.status,
        OperationStatus::Completed
    );
}

#[tokio::test]
async fn test_webhook_trigger() {
    let server = TestServer::start().await;

    let (status, created) = server
        .post(
            "/api/v1/webhooks",
            &server.admin_token,
            json!({
                "name": "deploy-prod",
                "stack_pattern": "prod-*",
                "server_ids": [server.server_id],
            }),
        )
        .await;
    assert_eq!(status, 201, "{created}");
    let webhook_id = created["data"]["id"].as_i64().unwrap();
    let api_key = created["data"]["api_key"].as_str().unwrap().to_string();
    assert!(api_key.starts_with("wh_"));
    let trigger = format!("/api/v1/webhooks/{webhook_id}/trigger");

    let (status, _) = server
        .post_anonymous(
            &trigger,
            json!({
                "api_key": "wh_wrong",
                "server_id": server.server_id,
                "stack_name": "prod-web",
                "command": "up",
            }),
        )
        .await;
    assert_eq!(status, 401);

    let (status, _) = server
        .post_anonymous(
            &trigger,
            json!({
                "api_key": api_key,
                "server_id": server.server_id,
                "stack_name": "staging-web",
                "command": "up",
            }),
        )
        .await;
    assert_eq!(status, 403);

    let (status, body) = server
        .post_anonymous(
            &trigger,
            json!({
                "api_key": api_key,
                "server_id": server.server_id,
                "stack_name": "prod-web",
                "operations": [{ "command": "pull" }, { "command": "up" }],
            }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert!(body["data"]["batchId"].is_string());
    let last = body["data"]["operations"][1]["operationId"]
        .as_str()
        .unwrap()
        .to_string();
    let row = server.wait_for_terminal(&last).await;
    assert_eq!(row.status, OperationStatus::Completed);
    assert_eq!(row.webhook_id, Some(webhook_id));

    let (_, webhook) = server
        .get(&format!("/api/v1/webhooks/{webhook_id}"), &server.admin_token)
        .await;
    assert_eq!(webhook["data"]["trigger_count"], 1);
}

#[tokio::test]
async fn test_regenerated_webhook_key_replaces_old_one() {
    let server = TestServer::start().await;

    let (status, created) = server
        .post(
            "/api/v1/webhooks",
            &server.admin_token,
            json!({ "name": "rotate-me", "stack_pattern": "*", "server_ids": [] }),
        )
        .await;
    assert_eq!(status, 201, "{created}");
    let webhook_id = created["data"]["id"].as_i64().unwrap();
    let old_key = created["data"]["api_key"].as_str().unwrap().to_string();

    let (status, regenerated) = server
        .post(
            &format!("/api/v1/webhooks/{webhook_id}/regenerate"),
            &server.admin_token,
            json!({}),
        )
        .await;
    assert_eq!(status, 200, "{regenerated}");
    let new_key = regenerated["data"]["api_key"].as_str().unwrap().to_string();
    assert_ne!(new_key, old_key);

    let trigger = format!("/api/v1/webhooks/{webhook_id}/trigger");
    let body = |key: &str| {
        json!({
            "api_key": key,
            "server_id": server.server_id,
            "stack_name": STACK,
            "command": "up",
        })
    };
    let (status, _) = server.post_anonymous(&trigger, body(&old_key)).await;
    assert_eq!(status, 401);

    let (status, triggered) = server.post_anonymous(&trigger, body(&new_key)).await;
    assert_eq!(status, 200, "{triggered}");
    let operation_id = triggered["data"]["operationId"].as_str().unwrap().to_string();
    assert_eq!(
        server.wait_for_terminal(&operation_id).await.status,
        OperationStatus::Completed
    );
}
