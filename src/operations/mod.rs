//! Agent relay for compose operations.
//!
//! A launched operation is streamed back from the agent over SSE. Frames are
//! appended to the operation log (which assigns their sequence numbers) and
//! then fanned out to live subscribers.

mod hub;

pub use hub::{HubFrame, SubscriberHub, Subscription};

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentClient;
use crate::audit::{AuditWriter, RequestMeta};
use crate::error::{Error, Result};
use crate::rbac::{Authorizer, Principal};
use crate::store::Store;
use crate::types::permission::STACKS_MANAGE;
use crate::types::{MessageType, OperationOutcome, OperationRequest, Server, StreamMessage};

/// Parsed frames in flight between the SSE reader and the log writer.
const FRAME_BUFFER: usize = 64;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchResponse {
    operation_id: String,
}

pub struct OperationService {
    store: Arc<dyn Store>,
    agent: Arc<AgentClient>,
    authorizer: Authorizer,
    audit: AuditWriter,
    hub: Arc<SubscriberHub>,
}

impl OperationService {
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<AgentClient>,
        authorizer: Authorizer,
        audit: AuditWriter,
        hub: Arc<SubscriberHub>,
    ) -> Self {
        Self {
            store,
            agent,
            authorizer,
            audit,
            hub,
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    /// Launches an operation directly on the agent without queueing or
    /// streaming. Returns the agent's operation id.
    pub async fn start_operation(
        &self,
        cancel: &CancellationToken,
        principal: &Principal,
        server: &Server,
        stack: &str,
        request: &OperationRequest,
        meta: &RequestMeta,
    ) -> Result<String> {
        if !self
            .authorizer
            .effective_allow(principal, server.id, stack, STACKS_MANAGE)?
        {
            self.audit
                .authorization_denied(principal, server.id, stack, STACKS_MANAGE, meta);
            return Err(Error::Forbidden(format!(
                "{STACKS_MANAGE} required on stack {stack}"
            )));
        }
        self.launch(cancel, server, stack, request).await
    }

    async fn launch(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        stack: &str,
        request: &OperationRequest,
    ) -> Result<String> {
        let endpoint = format!("/stacks/{}/operations", urlencoding::encode(stack));
        let response: LaunchResponse = self
            .agent
            .post_json(cancel, server, &endpoint, request)
            .await?;
        if response.operation_id.is_empty() {
            return Err(Error::AgentProtocol("agent returned an empty operationId".into()));
        }
        Ok(response.operation_id)
    }

    /// Launches the operation and relays its stream into the log header
    /// `log_id`, publishing under `operation_id`.
    ///
    /// Returns the outcome reported by the agent's `complete` frame. A stream
    /// that ends without one is closed with a synthesized `error`/`complete`
    /// pair and reported as unsuccessful. Cancellation returns
    /// [`Error::Cancelled`] and leaves closing the log to the caller.
    pub async fn start_and_execute(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        stack: &str,
        request: &OperationRequest,
        operation_id: &str,
        log_id: i64,
    ) -> Result<OperationOutcome> {
        let agent_operation_id = self.launch(cancel, server, stack, request).await?;
        info!(
            operation_id,
            agent_operation_id = %agent_operation_id,
            server_id = server.id,
            stack,
            command = %request.command,
            "operation launched"
        );

        let endpoint = format!(
            "/operations/{}/stream",
            urlencoding::encode(&agent_operation_id)
        );
        let mut stream = self.agent.stream(cancel, server, &endpoint).await?;

        let (tx, mut rx) = mpsc::channel::<StreamMessage>(FRAME_BUFFER);
        let reader_op = operation_id.to_string();
        let reader = tokio::spawn(async move {
            loop {
                let Some(line) = stream.next_data().await? else {
                    return Ok(());
                };
                let message: StreamMessage = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(operation_id = %reader_op, error = %e, "skipping malformed stream frame");
                        continue;
                    }
                };
                let is_complete = message.message_type == MessageType::Complete;
                if tx.send(message).await.is_err() || is_complete {
                    return Ok::<(), Error>(());
                }
            }
        });

        let mut outcome = None;
        while let Some(message) = rx.recv().await {
            self.persist_and_publish(operation_id, log_id, &message)?;
            if message.message_type == MessageType::Complete {
                outcome = Some(OperationOutcome {
                    operation_id: operation_id.to_string(),
                    success: message.success.unwrap_or(false),
                    exit_code: message.exit_code,
                });
                break;
            }
        }

        if let Some(outcome) = outcome {
            reader.abort();
            return Ok(outcome);
        }

        let reason = match reader.await {
            Ok(Ok(())) => "agent closed the stream before completion".to_string(),
            Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
            Ok(Err(e)) => format!("agent stream failed: {e}"),
            Err(e) => format!("stream reader stopped: {e}"),
        };

        debug!(operation_id, %reason, "synthesizing completion");
        self.record_failure(operation_id, log_id, &reason)?;
        Ok(OperationOutcome {
            operation_id: operation_id.to_string(),
            success: false,
            exit_code: None,
        })
    }

    /// Appends an `error` frame followed by an unsuccessful `complete` frame.
    pub fn record_failure(&self, operation_id: &str, log_id: i64, reason: &str) -> Result<()> {
        self.persist_and_publish(operation_id, log_id, &StreamMessage::error(reason))?;
        self.persist_and_publish(operation_id, log_id, &StreamMessage::complete(false, None))
    }

    fn persist_and_publish(
        &self,
        operation_id: &str,
        log_id: i64,
        message: &StreamMessage,
    ) -> Result<()> {
        let sequence = self.store.append_operation_message(
            log_id,
            message.message_type,
            &message.data,
            message.timestamp,
        )?;
        self.hub.publish(operation_id, sequence, message);
        Ok(())
    }
}
