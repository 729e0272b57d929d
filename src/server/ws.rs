//! WebSocket endpoints for following operations live.
//!
//! Two shapes share one relay loop: submit-and-subscribe, where the first
//! client message is an `operation_request`, and attach, which follows an
//! operation that already exists. Frames come from the subscriber hub;
//! anything the hub dropped is read back from the operation log by
//! sequence number, so clients always see a dense stream ending in exactly
//! one `complete`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::http::header::{HOST, ORIGIN};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Instant, interval, sleep_until};
use tracing::{debug, warn};

use crate::audit::RequestMeta;
use crate::auth::{ClientInfo, RequireAuth};
use crate::operations::{HubFrame, Subscription};
use crate::rbac::Principal;
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::server::user::access::{require_stack_permission, resolve_server};
use crate::server::validation::validate_stack_name;
use crate::types::permission::STACKS_READ;
use crate::types::{MessageType, OperationRequest, StreamMessage};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Server-to-client envelope.
#[derive(Debug, Serialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Envelope {
    fn data(kind: &'static str, data: Value) -> Self {
        Self {
            kind,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    fn error(error: impl Into<String>) -> Self {
        Self {
            kind: "error",
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }
}

/// Client-to-server envelope.
#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Why a socket stopped before its operation completed.
enum Stop {
    Disconnected,
    Failed(String),
}

impl From<crate::error::Error> for Stop {
    fn from(e: crate::error::Error) -> Self {
        Stop::Failed(e.to_string())
    }
}

/// Same-origin browsers and clients without an `Origin` header are let in.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(ORIGIN) else {
        return true;
    };
    let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Some((scheme, rest)) = origin.split_once("://") else {
        return false;
    };
    if !matches!(scheme, "http" | "https") {
        return false;
    }
    let origin_host = rest.split('/').next().unwrap_or_default();
    origin_host.eq_ignore_ascii_case(host)
}

/// `GET /ws/api/servers/{server_id}/stacks/{stack}/operations`
pub async fn operation_socket(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !origin_allowed(&headers) {
        return Err(ApiError::forbidden("cross-origin WebSocket upgrade rejected"));
    }
    validate_stack_name(&stack)?;
    resolve_server(&state, &ctx.principal, server_id)?;

    let principal = ctx.principal;
    Ok(ws
        .on_upgrade(move |socket| async move {
            submit_and_follow(state, socket, principal, server_id, stack, meta).await;
        })
        .into_response())
}

/// `GET /ws/api/servers/{server_id}/stacks/{stack}/operations/{operation_id}`
pub async fn attach_socket(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack, operation_id)): Path<(i64, String, String)>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !origin_allowed(&headers) {
        return Err(ApiError::forbidden("cross-origin WebSocket upgrade rejected"));
    }
    resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, STACKS_READ, &meta)?;

    let location = match state.store.get_queued_operation(&operation_id)? {
        Some(row) => Some((row.server_id, row.stack_name)),
        None => state
            .store
            .get_operation_log_by_operation_id(&operation_id)?
            .map(|log| (log.server_id, log.stack_name)),
    };
    if location != Some((server_id, stack)) {
        return Err(ApiError::not_found("Operation not found"));
    }

    Ok(ws
        .on_upgrade(move |socket| async move {
            let (mut sink, mut stream) = socket.split();
            let result = follow(&state, &mut sink, &mut stream, &operation_id).await;
            finish(&mut sink, result, &operation_id).await;
        })
        .into_response())
}

async fn submit_and_follow(
    state: Arc<AppState>,
    socket: WebSocket,
    principal: Principal,
    server_id: i64,
    stack: String,
    meta: RequestMeta,
) {
    let (mut sink, mut stream) = socket.split();

    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(stop) => {
            finish(&mut sink, Err(stop), "").await;
            return;
        }
    };

    let enqueued = match state
        .queue
        .enqueue_one(&principal, server_id, &stack, &request, &meta)
        .await
    {
        Ok(enqueued) => enqueued,
        Err(e) => {
            finish(&mut sink, Err(Stop::Failed(e.to_string())), "").await;
            return;
        }
    };

    let started = Envelope::data(
        "operation_started",
        serde_json::to_value(&enqueued).unwrap_or(Value::Null),
    );
    if send(&mut sink, &started).await.is_err() {
        return;
    }

    let result = follow(&state, &mut sink, &mut stream, &enqueued.operation_id).await;
    finish(&mut sink, result, &enqueued.operation_id).await;
}

/// Waits for the client's `operation_request`.
async fn read_request(stream: &mut WsStream) -> Result<OperationRequest, Stop> {
    let deadline = sleep_until(Instant::now() + READ_DEADLINE);
    tokio::pin!(deadline);

    loop {
        let incoming = tokio::select! {
            _ = &mut deadline => return Err(Stop::Failed("timed out waiting for operation_request".into())),
            incoming = stream.next() => incoming,
        };
        let text = match incoming {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(Stop::Disconnected),
            Some(Ok(_)) => continue,
        };

        let envelope: ClientEnvelope = serde_json::from_str(text.as_str())
            .map_err(|e| Stop::Failed(format!("invalid message: {e}")))?;
        if envelope.kind != "operation_request" {
            return Err(Stop::Failed(format!(
                "expected operation_request, got {}",
                envelope.kind
            )));
        }
        let request: OperationRequest = envelope
            .data
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Stop::Failed(format!("invalid operation_request: {e}")))?
            .ok_or_else(|| Stop::Failed("operation_request requires data".into()))?;
        if request.command.trim().is_empty() {
            return Err(Stop::Failed("command is required".into()));
        }
        return Ok(request);
    }
}

async fn send(sink: &mut WsSink, envelope: &Envelope) -> Result<(), Stop> {
    let text = serde_json::to_string(envelope).map_err(|e| Stop::Failed(e.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|_| Stop::Disconnected)
}

async fn finish(sink: &mut WsSink, result: Result<(), Stop>, operation_id: &str) {
    match result {
        Ok(()) | Err(Stop::Disconnected) => {}
        Err(Stop::Failed(reason)) => {
            debug!(operation_id, %reason, "closing operation socket");
            let _ = send(sink, &Envelope::error(reason)).await;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Subscribes to `operation_id` and relays until its `complete` frame.
async fn follow(
    state: &AppState,
    sink: &mut WsSink,
    stream: &mut WsStream,
    operation_id: &str,
) -> Result<(), Stop> {
    let hub = state.operations.hub().clone();
    let mut subscription = hub.subscribe(operation_id);
    let result = pump(state, sink, stream, &mut subscription).await;
    hub.unsubscribe(&subscription);
    result
}

async fn pump(
    state: &AppState,
    sink: &mut WsSink,
    stream: &mut WsStream,
    subscription: &mut Subscription,
) -> Result<(), Stop> {
    let mut cursor = Cursor::new(&subscription.operation_id);
    if cursor.catch_up(state, sink).await? {
        return Ok(());
    }

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;
    let deadline = sleep_until(Instant::now() + READ_DEADLINE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                return Err(Stop::Failed("server shutting down".into()));
            }
            frame = subscription.receiver.recv() => match frame {
                Some(frame) => {
                    if cursor.live(state, sink, frame).await? {
                        return Ok(());
                    }
                }
                None => return cursor.close_out(state, sink).await,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(Stop::Disconnected),
                Some(Ok(_)) => deadline.as_mut().reset(Instant::now() + READ_DEADLINE),
            },
            _ = ping.tick() => {
                sink.send(Message::Ping(Bytes::new()))
                    .await
                    .map_err(|_| Stop::Disconnected)?;
            }
            _ = &mut deadline => {
                debug!(operation_id = %subscription.operation_id, "read deadline passed");
                return Err(Stop::Disconnected);
            }
        }
    }
}

/// Tracks the last sequence number delivered to the client.
struct Cursor {
    operation_id: String,
    last_sequence: i64,
}

impl Cursor {
    fn new(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            last_sequence: 0,
        }
    }

    /// Sends logged frames past the cursor. A logged `complete` is only sent
    /// once the header is terminal, since its outcome lives on the header.
    /// Returns true once `complete` went out.
    async fn catch_up(&mut self, state: &AppState, sink: &mut WsSink) -> Result<bool, Stop> {
        let Some(log) = state
            .store
            .get_operation_log_by_operation_id(&self.operation_id)?
        else {
            return Ok(false);
        };
        let messages = state.store.list_operation_messages(log.id)?;
        let delivered = self.last_sequence;

        for row in messages
            .into_iter()
            .filter(|m| m.sequence_number > delivered)
        {
            if row.message_type == MessageType::Complete {
                if !log.status.is_terminal() {
                    break;
                }
                let mut complete = StreamMessage::complete(log.success.unwrap_or(false), log.exit_code);
                complete.timestamp = row.timestamp;
                self.last_sequence = row.sequence_number;
                send(sink, &frame_envelope(&complete)).await?;
                return Ok(true);
            }
            let message = StreamMessage {
                message_type: row.message_type,
                data: row.data,
                timestamp: row.timestamp,
                success: None,
                exit_code: None,
            };
            self.last_sequence = row.sequence_number;
            send(sink, &frame_envelope(&message)).await?;
        }
        Ok(false)
    }

    async fn live(&mut self, state: &AppState, sink: &mut WsSink, frame: HubFrame) -> Result<bool, Stop> {
        if frame.sequence > self.last_sequence + 1 && self.catch_up(state, sink).await? {
            return Ok(true);
        }
        if frame.sequence != self.last_sequence + 1 {
            return Ok(false);
        }
        self.last_sequence = frame.sequence;
        send(sink, &frame_envelope(&frame.message)).await?;
        Ok(frame.message.message_type == MessageType::Complete)
    }

    /// The hub closed the operation: drain the log, synthesizing the
    /// `complete` only if the log never recorded one.
    async fn close_out(&mut self, state: &AppState, sink: &mut WsSink) -> Result<(), Stop> {
        if self.catch_up(state, sink).await? {
            return Ok(());
        }
        warn!(operation_id = %self.operation_id, "operation closed without a logged completion");
        send(sink, &frame_envelope(&StreamMessage::complete(false, None))).await
    }
}

fn frame_envelope(message: &StreamMessage) -> Envelope {
    let kind = if message.message_type == MessageType::Complete {
        "complete"
    } else {
        "stream_data"
    };
    Envelope::data(kind, serde_json::to_value(message).unwrap_or(Value::Null))
}
