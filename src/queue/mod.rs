//! Per-stack serialized operation queue.
//!
//! Each `(server, stack)` pair gets one worker task fed by a FIFO channel of
//! operation ids. Rows live in the store; the channel only carries ids, so a
//! restart loses nothing: [`QueueService::replay`] resubmits queued rows.

mod reaper;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditWriter, OperationMirror, RequestMeta};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::operations::OperationService;
use crate::rbac::{Authorizer, Principal};
use crate::store::Store;
use crate::types::permission::STACKS_MANAGE;
use crate::types::{OperationRequest, OperationStatus, QueuedOperation};

pub type StackKey = (i64, String);

/// What intake reports for one queued operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub operation_id: String,
    pub position_in_queue: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMember {
    pub operation_id: String,
    pub order: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnqueued {
    pub batch_id: String,
    pub operations: Vec<BatchMember>,
    pub position_in_queue: i64,
}

struct StackWorker {
    sender: mpsc::Sender<String>,
    /// Serializes insert-then-send so channel order matches `queued_at`.
    intake: tokio::sync::Mutex<()>,
}

pub(crate) struct QueueInner {
    store: Arc<dyn Store>,
    authorizer: Authorizer,
    audit: AuditWriter,
    operations: Arc<OperationService>,
    mirror: Arc<OperationMirror>,
    config: QueueConfig,
    cancel: CancellationToken,
    workers: RwLock<HashMap<StackKey, Arc<StackWorker>>>,
    /// Operation ids currently executing in this process.
    active: Mutex<HashSet<String>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct QueueService {
    inner: Arc<QueueInner>,
}

/// `op_` followed by the first 8 hex digits of a v4 uuid.
#[must_use]
pub fn new_operation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("op_{}", &id[..8])
}

impl QueueService {
    pub fn new(
        store: Arc<dyn Store>,
        authorizer: Authorizer,
        audit: AuditWriter,
        operations: Arc<OperationService>,
        mirror: Arc<OperationMirror>,
        config: QueueConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                authorizer,
                audit,
                operations,
                mirror,
                config,
                cancel,
                workers: RwLock::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    fn worker_for(&self, key: &StackKey) -> Arc<StackWorker> {
        if let Some(worker) = self
            .inner
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return worker.clone();
        }

        let mut workers = self.inner.workers.write().unwrap_or_else(|e| e.into_inner());
        workers
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity.max(1));
                let inner = self.inner.clone();
                let task_key = key.clone();
                let handle = tokio::spawn(async move { worker::run(inner, task_key, rx).await });
                self.inner
                    .handles
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(handle);
                info!(server_id = key.0, stack = %key.1, "stack worker started");
                Arc::new(StackWorker {
                    sender: tx,
                    intake: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    fn authorize(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
        meta: &RequestMeta,
    ) -> Result<()> {
        match self.inner.store.get_server(server_id)? {
            Some(server) if server.is_active => {}
            _ => return Err(Error::NotFound),
        }
        if self
            .inner
            .authorizer
            .effective_allow(principal, server_id, stack, STACKS_MANAGE)?
        {
            return Ok(());
        }
        self.inner
            .audit
            .authorization_denied(principal, server_id, stack, STACKS_MANAGE, meta);
        Err(Error::Forbidden(format!(
            "{STACKS_MANAGE} required on stack {stack}"
        )))
    }

    fn build_row(
        principal: &Principal,
        server_id: i64,
        stack: &str,
        request: &OperationRequest,
    ) -> Result<QueuedOperation> {
        validate_request(stack, request)?;
        Ok(QueuedOperation {
            id: 0,
            operation_id: new_operation_id(),
            user_id: principal.user_id(),
            server_id,
            stack_name: stack.to_string(),
            command: request.command.clone(),
            options: request.encoded_options()?,
            services: request.encoded_services()?,
            status: OperationStatus::Queued,
            priority: 0,
            batch_id: None,
            order_index: 0,
            depends_on: None,
            webhook_id: principal.webhook_id(),
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        })
    }

    async fn submit(&self, worker: &StackWorker, operation_id: String) -> Result<()> {
        worker
            .sender
            .send(operation_id)
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub async fn enqueue_one(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
        request: &OperationRequest,
        meta: &RequestMeta,
    ) -> Result<Enqueued> {
        self.authorize(principal, server_id, stack, meta)?;
        let mut row = Self::build_row(principal, server_id, stack, request)?;

        let key = (server_id, stack.to_string());
        let worker = self.worker_for(&key);
        let position;
        {
            let _intake = worker.intake.lock().await;
            row.queued_at = Utc::now();
            row.id = self.inner.store.create_queued_operation(&row)?;
            self.inner.mirror.record("create", &row);
            position = self.inner.store.queue_position(&row)?;
            self.submit(&worker, row.operation_id.clone()).await?;
        }

        info!(
            operation_id = %row.operation_id,
            server_id,
            stack,
            command = %row.command,
            position,
            "operation queued"
        );
        Ok(Enqueued {
            operation_id: row.operation_id,
            position_in_queue: position,
        })
    }

    /// Queues `requests` as one batch. Member *i* depends on member *i-1*;
    /// only the head is handed to the worker, which walks the chain itself.
    pub async fn enqueue_batch(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
        requests: &[OperationRequest],
        meta: &RequestMeta,
    ) -> Result<BatchEnqueued> {
        if requests.is_empty() {
            return Err(Error::Validation("operations must not be empty".into()));
        }
        for _ in requests {
            self.authorize(principal, server_id, stack, meta)?;
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut rows = Vec::with_capacity(requests.len());
        let mut previous: Option<String> = None;
        for (index, request) in requests.iter().enumerate() {
            let mut row = Self::build_row(principal, server_id, stack, request)?;
            row.batch_id = Some(batch_id.clone());
            row.order_index = i32::try_from(index)
                .map_err(|_| Error::Validation("too many operations in batch".into()))?;
            row.depends_on = previous.replace(row.operation_id.clone());
            rows.push(row);
        }

        let key = (server_id, stack.to_string());
        let worker = self.worker_for(&key);
        let position;
        {
            let _intake = worker.intake.lock().await;
            let queued_at = Utc::now();
            for row in &mut rows {
                row.queued_at = queued_at;
                row.id = self.inner.store.create_queued_operation(row)?;
                self.inner.mirror.record("create", row);
            }
            position = self.inner.store.queue_position(&rows[0])?;
            self.submit(&worker, rows[0].operation_id.clone()).await?;
        }

        info!(%batch_id, server_id, stack, size = rows.len(), "batch queued");
        Ok(BatchEnqueued {
            batch_id,
            operations: rows
                .into_iter()
                .map(|row| BatchMember {
                    operation_id: row.operation_id,
                    order: row.order_index,
                    depends_on: row.depends_on,
                })
                .collect(),
            position_in_queue: position,
        })
    }

    /// Resubmits every queued row, oldest first. Running rows are left for
    /// the reaper.
    pub async fn replay(&self) -> Result<usize> {
        let rows = self
            .inner
            .store
            .list_queued_operations_by_status(OperationStatus::Queued)?;
        let count = rows.len();
        for row in rows {
            let worker = self.worker_for(&(row.server_id, row.stack_name.clone()));
            let _intake = worker.intake.lock().await;
            self.submit(&worker, row.operation_id).await?;
        }
        if count > 0 {
            info!(count, "replayed queued operations");
        }
        Ok(count)
    }

    /// Spawns the periodic stale-operation sweep.
    pub fn start_reaper(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { reaper::run(inner).await });
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// One reaper pass. Returns the number of operations promoted.
    pub fn reap_stale(&self) -> Result<usize> {
        reaper::sweep(&self.inner)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Waits for workers and the reaper after the root token is cancelled.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<_> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "queue task ended abnormally");
            }
        }
    }
}

fn validate_request(stack: &str, request: &OperationRequest) -> Result<()> {
    if stack.trim().is_empty() {
        return Err(Error::Validation("stack name is required".into()));
    }
    if request.command.trim().is_empty() {
        return Err(Error::Validation("command is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_format() {
        let id = new_operation_id();
        assert_eq!(id.len(), 11);
        assert!(id.starts_with("op_"));
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_operation_id(), new_operation_id());
    }

    #[test]
    fn test_validate_request() {
        let ok = OperationRequest {
            command: "up".into(),
            ..Default::default()
        };
        assert!(validate_request("web", &ok).is_ok());
        assert!(validate_request(" ", &ok).is_err());
        assert!(validate_request("web", &OperationRequest::default()).is_err());
    }
}
