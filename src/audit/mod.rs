//! Security audit trail and the optional operation file mirror.
//!
//! Neither sink may fail the caller: write errors are logged and dropped.

mod file;

pub use file::RotatingFile;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::config::ServerConfig;
use crate::rbac::Principal;
use crate::store::{NewSecurityAudit, Store};
use crate::types::QueuedOperation;

pub const CATEGORY_RBAC: &str = "rbac";
pub const CATEGORY_AUTH: &str = "auth";
pub const CATEGORY_API_KEY: &str = "api_key";
pub const CATEGORY_WEBHOOK: &str = "webhook";
pub const CATEGORY_ADMIN: &str = "admin";

pub const SEVERITY_INFO: &str = "info";
pub const SEVERITY_WARNING: &str = "warning";

/// Where a request came from.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: String,
    pub user_agent: String,
}

#[derive(Clone)]
pub struct AuditWriter {
    store: Arc<dyn Store>,
}

impl AuditWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn record(&self, event: NewSecurityAudit) {
        if let Err(e) = self.store.insert_security_audit(&event) {
            warn!(event_type = %event.event_type, error = %e, "failed to write audit event");
        }
    }

    /// Records a denied stack permission check.
    pub fn authorization_denied(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
        permission: &str,
        meta: &RequestMeta,
    ) {
        self.record(NewSecurityAudit {
            event_type: "authorization_denied".to_string(),
            category: CATEGORY_RBAC.to_string(),
            severity: SEVERITY_WARNING.to_string(),
            actor_user_id: Some(principal.user_id()),
            actor_ip: meta.ip.clone(),
            actor_user_agent: meta.user_agent.clone(),
            target_type: Some("stack".to_string()),
            target_name: Some(stack.to_string()),
            success: false,
            failure_reason: Some(format!("missing permission {permission}")),
            metadata: serde_json::json!({
                "permission": permission,
                "principal": principal.kind(),
                "webhook_id": principal.webhook_id(),
            }),
            server_id: Some(server_id),
            stack_name: Some(stack.to_string()),
            ..Default::default()
        });
    }

    /// Records a login, refresh or logout outcome.
    pub fn auth_event(
        &self,
        event_type: &str,
        user_id: Option<i64>,
        success: bool,
        failure_reason: Option<&str>,
        meta: &RequestMeta,
    ) {
        self.record(NewSecurityAudit {
            event_type: event_type.to_string(),
            category: CATEGORY_AUTH.to_string(),
            severity: if success { SEVERITY_INFO } else { SEVERITY_WARNING }.to_string(),
            actor_user_id: user_id,
            actor_ip: meta.ip.clone(),
            actor_user_agent: meta.user_agent.clone(),
            target_type: Some("user".to_string()),
            target_id: user_id,
            success,
            failure_reason: failure_reason.map(str::to_string),
            ..Default::default()
        });
    }

    /// Records a successful sensitive mutation.
    #[allow(clippy::too_many_arguments)]
    pub fn mutation(
        &self,
        category: &str,
        event_type: &str,
        actor_user_id: i64,
        target_type: &str,
        target_id: Option<i64>,
        target_name: Option<&str>,
        meta: &RequestMeta,
    ) {
        self.record(NewSecurityAudit {
            event_type: event_type.to_string(),
            category: category.to_string(),
            severity: SEVERITY_INFO.to_string(),
            actor_user_id: Some(actor_user_id),
            actor_ip: meta.ip.clone(),
            actor_user_agent: meta.user_agent.clone(),
            target_type: Some(target_type.to_string()),
            target_id,
            target_name: target_name.map(str::to_string),
            success: true,
            ..Default::default()
        });
    }
}

#[derive(Serialize)]
struct OperationEntry<'a> {
    timestamp: chrono::DateTime<Utc>,
    action: &'a str,
    operation: &'a QueuedOperation,
}

/// Mirrors queue-row creates and status changes to a JSON-lines file.
pub struct OperationMirror {
    file: Option<RotatingFile>,
}

impl OperationMirror {
    #[must_use]
    pub fn disabled() -> Self {
        Self { file: None }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        if !config.operation_log.log_to_file {
            return Self::disabled();
        }
        Self {
            file: Some(RotatingFile::new(
                config.operation_log_path(),
                config.operation_log.max_file_bytes,
                config.operation_log.max_backups,
            )),
        }
    }

    pub fn record(&self, action: &str, operation: &QueuedOperation) {
        let Some(file) = &self.file else {
            return;
        };
        let entry = OperationEntry {
            timestamp: Utc::now(),
            action,
            operation,
        };
        if let Err(e) = file.append(&entry) {
            warn!(path = %file.path().display(), error = %e, "failed to mirror operation");
        }
    }
}
