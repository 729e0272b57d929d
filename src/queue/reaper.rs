use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::QueueInner;
use crate::error::Result;
use crate::types::{OperationLog, OperationStatus};

pub(super) const STALE_REASON: &str = "no heartbeat after restart";

pub(super) async fn run(inner: Arc<QueueInner>) {
    let mut ticker = tokio::time::interval(inner.config.reaper_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match sweep(&inner) {
            Ok(0) => {}
            Ok(count) => info!(count, "reaped stale operations"),
            Err(e) => warn!(error = %e, "stale operation sweep failed"),
        }
    }
}

/// Fails operations that have gone silent and reconciles queue rows left
/// `running` by a crash. Operations executing in this process are skipped.
pub(super) fn sweep(inner: &QueueInner) -> Result<usize> {
    let now = Utc::now();
    let cutoff = now - inner.config.stale_after();
    let active: HashSet<String> = inner
        .active
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let mut promoted = 0;
    for log in inner.store.stale_operation_logs(cutoff)? {
        if active.contains(&log.operation_id) {
            continue;
        }
        match fail_stale_log(inner, &log, now) {
            Ok(()) => promoted += 1,
            Err(e) => warn!(operation_id = %log.operation_id, error = %e, "failed to reap operation"),
        }
    }

    for row in inner
        .store
        .list_queued_operations_by_status(OperationStatus::Running)?
    {
        if active.contains(&row.operation_id) {
            continue;
        }
        let header = inner.store.get_operation_log_by_operation_id(&row.operation_id)?;
        let (status, reason) = match header {
            Some(log) if log.status.is_terminal() => (log.status, None),
            Some(_) => continue,
            None if row.started_at.unwrap_or(row.queued_at) < cutoff => {
                (OperationStatus::Failed, Some(STALE_REASON))
            }
            None => continue,
        };
        inner
            .store
            .update_queued_operation_status(&row.operation_id, status, reason, now)?;
        super::worker::mirror_status(inner, &row.operation_id);
        promoted += 1;
    }

    Ok(promoted)
}

fn fail_stale_log(inner: &QueueInner, log: &OperationLog, now: DateTime<Utc>) -> Result<()> {
    inner
        .operations
        .record_failure(&log.operation_id, log.id, STALE_REASON)?;
    inner
        .store
        .finalize_operation_log(log.id, OperationStatus::Failed, now, false, None)?;

    if let Some(row) = inner.store.get_queued_operation(&log.operation_id)? {
        if !row.status.is_terminal() {
            inner.store.update_queued_operation_status(
                &row.operation_id,
                OperationStatus::Failed,
                Some(STALE_REASON),
                now,
            )?;
            super::worker::mirror_status(inner, &row.operation_id);
        }
    }
    inner.operations.hub().close(&log.operation_id);
    warn!(operation_id = %log.operation_id, "operation failed: {STALE_REASON}");
    Ok(())
}
