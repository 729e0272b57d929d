use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::{QueueInner, StackKey};
use crate::error::{Error, Result};
use crate::store::NewOperationLog;
use crate::types::{OperationRequest, OperationStatus, QueuedOperation};

enum Dependency {
    Ready,
    Skip(String),
    Shutdown,
}

/// Drains one stack's channel, one operation at a time.
pub(super) async fn run(inner: Arc<QueueInner>, key: StackKey, mut rx: mpsc::Receiver<String>) {
    loop {
        let operation_id = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        let mut next = Some(operation_id);
        while let Some(id) = next.take() {
            next = match process(&inner, &id).await {
                Ok(next) => next,
                Err(e) => {
                    error!(operation_id = %id, error = %e, "operation processing failed");
                    None
                }
            };
            if inner.cancel.is_cancelled() {
                break;
            }
        }
    }
    debug!(server_id = key.0, stack = %key.1, "stack worker stopped");
}

/// Runs one queued operation. Returns the next batch member to run inline.
async fn process(inner: &QueueInner, operation_id: &str) -> Result<Option<String>> {
    let Some(op) = inner.store.get_queued_operation(operation_id)? else {
        warn!(operation_id, "queued operation vanished");
        return Ok(None);
    };
    if op.status != OperationStatus::Queued {
        debug!(operation_id, status = %op.status, "skipping operation that is no longer queued");
        return Ok(None);
    }

    if let Some(dependency) = &op.depends_on {
        match wait_for_dependency(inner, dependency).await? {
            Dependency::Ready => {}
            Dependency::Skip(reason) => {
                skip(inner, &op, &reason)?;
                return next_batch_member(inner, &op);
            }
            Dependency::Shutdown => return Ok(None),
        }
    }

    inner
        .active
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(op.operation_id.clone());
    let result = execute(inner, &op).await;
    inner
        .active
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&op.operation_id);
    result?;

    if inner.cancel.is_cancelled() {
        return Ok(None);
    }
    next_batch_member(inner, &op)
}

async fn wait_for_dependency(inner: &QueueInner, dependency: &str) -> Result<Dependency> {
    let deadline = Instant::now() + inner.config.dependency_timeout();
    loop {
        let status = inner
            .store
            .get_queued_operation(dependency)?
            .map(|d| d.status);
        match status {
            Some(OperationStatus::Completed) => return Ok(Dependency::Ready),
            Some(status @ (OperationStatus::Failed | OperationStatus::Cancelled)) => {
                return Ok(Dependency::Skip(format!("dependency {dependency} {status}")));
            }
            None => {
                return Ok(Dependency::Skip(format!("dependency {dependency} not found")));
            }
            Some(OperationStatus::Queued | OperationStatus::Running) => {}
        }

        if Instant::now() >= deadline {
            return Ok(Dependency::Skip(format!(
                "timed out waiting for dependency {dependency}"
            )));
        }
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(Dependency::Shutdown),
            _ = sleep(inner.config.dependency_poll()) => {}
        }
    }
}

fn next_batch_member(inner: &QueueInner, op: &QueuedOperation) -> Result<Option<String>> {
    let Some(batch_id) = &op.batch_id else {
        return Ok(None);
    };
    Ok(inner
        .store
        .find_batch_member(batch_id, op.order_index + 1)?
        .filter(|next| next.status == OperationStatus::Queued)
        .map(|next| next.operation_id))
}

/// Records a dependency-skipped operation as cancelled without contacting
/// the agent.
fn skip(inner: &QueueInner, op: &QueuedOperation, reason: &str) -> Result<()> {
    let now = Utc::now();
    let mut header = NewOperationLog::from_queued(op, now);
    header.status = OperationStatus::Cancelled;
    let log_id = inner.store.create_operation_log(&header)?;
    inner
        .operations
        .record_failure(&op.operation_id, log_id, reason)?;

    inner
        .store
        .finalize_operation_log(log_id, OperationStatus::Cancelled, now, false, None)?;
    inner.store.update_queued_operation_status(
        &op.operation_id,
        OperationStatus::Cancelled,
        Some(reason),
        now,
    )?;
    mirror_status(inner, &op.operation_id);
    inner.operations.hub().close(&op.operation_id);

    info!(operation_id = %op.operation_id, %reason, "operation cancelled");
    Ok(())
}

async fn execute(inner: &QueueInner, op: &QueuedOperation) -> Result<()> {
    let start = Utc::now();
    inner.store.update_queued_operation_status(
        &op.operation_id,
        OperationStatus::Running,
        None,
        start,
    )?;
    mirror_status(inner, &op.operation_id);

    let log_id = match inner
        .store
        .create_operation_log(&NewOperationLog::from_queued(op, start))
    {
        Ok(id) => id,
        Err(e) => {
            inner.store.update_queued_operation_status(
                &op.operation_id,
                OperationStatus::Failed,
                Some(&e.to_string()),
                Utc::now(),
            )?;
            mirror_status(inner, &op.operation_id);
            return Err(e);
        }
    };

    let result = run_on_agent(inner, op, log_id).await;

    let (status, success, exit_code, reason) = match result {
        Ok(outcome) if outcome.success => (OperationStatus::Completed, true, outcome.exit_code, None),
        Ok(outcome) => (
            OperationStatus::Failed,
            false,
            outcome.exit_code,
            Some(match outcome.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "operation did not complete".to_string(),
            }),
        ),
        Err(e) => {
            let (message, reason) = match e {
                Error::Cancelled => ("operation cancelled".to_string(), "cancelled".to_string()),
                e => (e.to_string(), e.to_string()),
            };
            if let Err(write_err) = inner
                .operations
                .record_failure(&op.operation_id, log_id, &message)
            {
                warn!(operation_id = %op.operation_id, error = %write_err, "failed to record failure");
            }
            (OperationStatus::Failed, false, None, Some(reason))
        }
    };

    let end = Utc::now();
    inner
        .store
        .finalize_operation_log(log_id, status, end, success, exit_code)?;
    inner.store.update_queued_operation_status(
        &op.operation_id,
        status,
        reason.as_deref(),
        end,
    )?;
    mirror_status(inner, &op.operation_id);
    inner.operations.hub().close(&op.operation_id);

    info!(
        operation_id = %op.operation_id,
        server_id = op.server_id,
        stack = %op.stack_name,
        %status,
        ?exit_code,
        duration_ms = (end - start).num_milliseconds(),
        "operation finished"
    );
    Ok(())
}

async fn run_on_agent(
    inner: &QueueInner,
    op: &QueuedOperation,
    log_id: i64,
) -> Result<crate::types::OperationOutcome> {
    let server = inner.store.get_server(op.server_id)?.ok_or_else(|| {
        Error::AgentUnavailable(format!("server {} no longer exists", op.server_id))
    })?;
    if !server.is_active {
        return Err(Error::AgentUnavailable(format!(
            "server {} is inactive",
            server.name
        )));
    }
    let request = OperationRequest::from_encoded(&op.command, &op.options, &op.services)?;

    inner
        .operations
        .start_and_execute(
            &inner.cancel,
            &server,
            &op.stack_name,
            &request,
            &op.operation_id,
            log_id,
        )
        .await
}

pub(super) fn mirror_status(inner: &QueueInner, operation_id: &str) {
    match inner.store.get_queued_operation(operation_id) {
        Ok(Some(row)) => inner.mirror.record("update", &row),
        Ok(None) => {}
        Err(e) => warn!(operation_id, error = %e, "failed to load operation for mirror"),
    }
}
