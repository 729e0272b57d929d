//! An agent speaking the HTTP surface Berth drives, over plain HTTP.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};

pub const AGENT_TOKEN: &str = "agent-secret";

/// Delay between streamed frames.
const FRAME_DELAY: Duration = Duration::from_millis(40);
const SLOW_FRAME_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct LaunchedOperation {
    pub agent_id: String,
    pub stack: String,
    pub command: String,
}

#[derive(Default)]
struct AgentState {
    stacks: Vec<String>,
    next_id: AtomicUsize,
    launched: Mutex<Vec<LaunchedOperation>>,
    pending: Mutex<HashMap<String, LaunchedOperation>>,
    running: Mutex<HashMap<String, usize>>,
    max_concurrent: Mutex<HashMap<String, usize>>,
}

impl AgentState {
    fn enter(&self, stack: &str) {
        let mut running = self.running.lock().unwrap();
        let count = running.entry(stack.to_string()).or_default();
        *count += 1;
        let mut max = self.max_concurrent.lock().unwrap();
        let peak = max.entry(stack.to_string()).or_default();
        *peak = (*peak).max(*count);
    }

    fn leave(&self, stack: &str) {
        if let Some(count) = self.running.lock().unwrap().get_mut(stack) {
            *count = count.saturating_sub(1);
        }
    }
}

pub struct FakeAgent {
    pub port: u16,
    state: Arc<AgentState>,
}

impl FakeAgent {
    pub async fn start(stacks: &[&str]) -> Self {
        let state = Arc::new(AgentState {
            stacks: stacks.iter().map(|s| (*s).to_string()).collect(),
            ..AgentState::default()
        });
        let app = Router::new()
            .route("/api/health", get(|| async { "OK" }))
            .route("/api/stacks", get(list_stacks))
            .route("/api/stacks/{name}", get(get_stack))
            .route("/api/stacks/{name}/operations", post(launch))
            .route("/api/operations/{id}/stream", get(stream))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake agent");
        let port = listener.local_addr().expect("agent addr").port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake agent");
        });
        Self { port, state }
    }

    pub fn launched(&self) -> Vec<LaunchedOperation> {
        self.state.launched.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self, stack: &str) -> usize {
        self.state
            .max_concurrent
            .lock()
            .unwrap()
            .get(stack)
            .copied()
            .unwrap_or_default()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|h| h == format!("Bearer {AGENT_TOKEN}"))
}

async fn list_stacks(State(state): State<Arc<AgentState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let stacks: Vec<Value> = state
        .stacks
        .iter()
        .map(|name| json!({ "name": name, "status": "running" }))
        .collect();
    Json(stacks).into_response()
}

async fn get_stack(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.stacks.contains(&name) {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "stack not found" }))).into_response();
    }
    Json(json!({ "name": name, "status": "running", "services": [] })).into_response()
}

async fn launch(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = format!("agent_{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    let op = LaunchedOperation {
        agent_id: id.clone(),
        stack: name,
        command: body["command"].as_str().unwrap_or_default().to_string(),
    };
    state.enter(&op.stack);
    state.launched.lock().unwrap().push(op.clone());
    state.pending.lock().unwrap().insert(id.clone(), op);
    Json(json!({ "operationId": id })).into_response()
}

/// Frames the agent streams for `command`, each preceded by its delay.
///
/// `fail` exits 1, `drop` hangs up before completing, `hang` stays quiet for
/// a minute before completing, and `slow` spaces its lines out. Anything else
/// prints three lines and succeeds.
fn frames_for(command: &str) -> Vec<(Duration, Value)> {
    let now = chrono::Utc::now().to_rfc3339();
    let line = |n: usize| json!({ "type": "stdout", "data": format!("{command} step {n}"), "timestamp": now });
    let complete = |success: bool, code: i64| {
        json!({ "type": "complete", "data": "", "timestamp": now, "success": success, "exitCode": code })
    };
    match command {
        "fail" => vec![
            (FRAME_DELAY, json!({ "type": "stderr", "data": "something broke", "timestamp": now })),
            (FRAME_DELAY, complete(false, 1)),
        ],
        "drop" => vec![(FRAME_DELAY, line(1))],
        "hang" => vec![
            (FRAME_DELAY, line(1)),
            (Duration::from_secs(60), complete(true, 0)),
        ],
        "slow" => vec![
            (SLOW_FRAME_DELAY, line(1)),
            (SLOW_FRAME_DELAY, line(2)),
            (SLOW_FRAME_DELAY, line(3)),
            (SLOW_FRAME_DELAY, complete(true, 0)),
        ],
        _ => vec![
            (FRAME_DELAY, line(1)),
            (FRAME_DELAY, line(2)),
            (FRAME_DELAY, line(3)),
            (FRAME_DELAY, complete(true, 0)),
        ],
    }
}

async fn stream(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(op) = state.pending.lock().unwrap().remove(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let frames = frames_for(&op.command).into_iter();
    let body = futures_util::stream::unfold(
        (frames, state, op.stack),
        |(mut frames, state, stack)| async move {
            let (delay, frame) = frames.next()?;
            tokio::time::sleep(delay).await;
            if frames.len() == 0 {
                state.leave(&stack);
            }
            let chunk = Bytes::from(format!("data: {frame}\n\n"));
            Some((Ok::<_, Infallible>(chunk), (frames, state, stack)))
        },
    );

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(body))
        .unwrap()
}
