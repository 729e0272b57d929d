mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::types::*;

/// Fields needed to register a server. `access_token` is already sealed.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub port: u16,
    pub skip_ssl_verification: bool,
    pub access_token: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: i64,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewApiKeyScope {
    pub server_id: Option<i64>,
    pub stack_pattern: String,
    pub permission_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub api_key_hash: String,
    pub key_prefix: String,
    pub stack_pattern: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Header fields written when a worker starts an operation.
#[derive(Debug, Clone)]
pub struct NewOperationLog {
    pub operation_id: String,
    pub user_id: i64,
    pub server_id: i64,
    pub stack_name: String,
    pub command: String,
    pub options: String,
    pub services: String,
    pub status: OperationStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub batch_id: Option<String>,
    pub order_index: i32,
    pub depends_on: Option<String>,
    pub webhook_id: Option<i64>,
}

impl NewOperationLog {
    #[must_use]
    pub fn from_queued(op: &QueuedOperation, start_time: DateTime<Utc>) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            user_id: op.user_id,
            server_id: op.server_id,
            stack_name: op.stack_name.clone(),
            command: op.command.clone(),
            options: op.options.clone(),
            services: op.services.clone(),
            status: OperationStatus::Running,
            queued_at: Some(op.queued_at),
            start_time,
            batch_id: op.batch_id.clone(),
            order_index: op.order_index,
            depends_on: op.depends_on.clone(),
            webhook_id: op.webhook_id,
        }
    }
}

/// Outcome-based filter for operation-log listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeFilter {
    /// Reached a terminal status.
    Complete,
    /// Still queued or running.
    Incomplete,
    Failed,
    Success,
}

impl OutcomeFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(Self::Complete),
            "incomplete" => Some(Self::Incomplete),
            "failed" => Some(Self::Failed),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationLogFilter {
    pub user_id: Option<i64>,
    pub server_id: Option<i64>,
    /// Substring match.
    pub stack_name: Option<String>,
    pub command: Option<String>,
    pub outcome: Option<OutcomeFilter>,
    pub days_back: Option<i64>,
    /// Free-text search over stack name, command and operation id.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationLogStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub running: i64,
    pub queued: i64,
}

/// An audit record before it is persisted.
#[derive(Debug, Clone, Default)]
pub struct NewSecurityAudit {
    pub event_type: String,
    pub category: String,
    pub severity: String,
    pub actor_user_id: Option<i64>,
    pub actor_ip: String,
    pub actor_user_agent: String,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub target_name: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    pub server_id: Option<i64>,
    pub stack_name: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityAuditFilter {
    pub event_type: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
    pub actor_user_id: Option<i64>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityAuditStats {
    pub total: i64,
    pub failures: i64,
    pub by_category: BTreeMap<String, i64>,
    pub by_severity: BTreeMap<String, i64>,
}

/// Users, roles, permissions, servers, grants and credentials.
pub trait IdentityStore: Send + Sync {
    // User operations
    fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User>;
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;
    fn delete_user(&self, id: i64) -> Result<bool>;

    // Role operations
    fn create_role(&self, name: &str, description: Option<&str>, is_admin: bool) -> Result<Role>;
    fn get_role(&self, id: i64) -> Result<Option<Role>>;
    fn get_role_by_name(&self, name: &str) -> Result<Option<Role>>;
    fn list_roles(&self) -> Result<Vec<Role>>;
    fn delete_role(&self, id: i64) -> Result<bool>;
    fn assign_role(&self, user_id: i64, role_id: i64) -> Result<()>;
    fn remove_role(&self, user_id: i64, role_id: i64) -> Result<bool>;
    fn list_user_roles(&self, user_id: i64) -> Result<Vec<Role>>;

    // Permission catalogue
    fn upsert_permission(&self, def: &permission::PermissionDef) -> Result<()>;
    fn get_permission(&self, id: i64) -> Result<Option<Permission>>;
    fn get_permission_by_name(&self, name: &str) -> Result<Option<Permission>>;
    fn list_permissions(&self) -> Result<Vec<Permission>>;

    // Server operations
    fn create_server(&self, server: &NewServer) -> Result<Server>;
    fn get_server(&self, id: i64) -> Result<Option<Server>>;
    fn list_servers(&self) -> Result<Vec<Server>>;
    fn list_active_server_ids(&self) -> Result<Vec<i64>>;
    fn update_server(&self, server: &Server) -> Result<()>;
    fn delete_server(&self, id: i64) -> Result<bool>;

    // Role stack grants
    fn create_stack_permission(
        &self,
        server_id: i64,
        role_id: i64,
        permission_id: i64,
        stack_pattern: &str,
    ) -> Result<StackPermission>;
    fn list_role_stack_permissions(&self, role_id: i64) -> Result<Vec<StackPermission>>;
    fn delete_stack_permission(&self, role_id: i64, id: i64) -> Result<bool>;
    fn list_stack_permissions_for_roles(
        &self,
        server_id: i64,
        role_ids: &[i64],
    ) -> Result<Vec<StackPermission>>;
    fn list_server_ids_for_roles(&self, role_ids: &[i64]) -> Result<Vec<i64>>;

    // Sessions
    fn create_session(
        &self,
        user_id: i64,
        access_hash: &str,
        refresh_hash: &str,
        access_expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<Session>;
    fn get_session_by_access_hash(&self, hash: &str) -> Result<Option<Session>>;
    fn get_session_by_refresh_hash(&self, hash: &str) -> Result<Option<Session>>;
    fn delete_session(&self, id: i64) -> Result<bool>;
    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    // API keys
    fn create_api_key(&self, key: &NewApiKey) -> Result<ApiKey>;
    /// Inserts the key and its scopes in one transaction.
    fn create_api_key_with_scopes(
        &self,
        key: &NewApiKey,
        scopes: &[NewApiKeyScope],
    ) -> Result<(ApiKey, Vec<ApiKeyScope>)>;
    fn get_api_key(&self, id: i64) -> Result<Option<ApiKey>>;
    fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>>;
    fn list_user_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>>;
    /// Moves `last_used_at` forward only.
    fn touch_api_key(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
    /// Deactivates the key and rewrites its hash so it can never match again.
    fn soft_delete_api_key(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;
    fn create_api_key_scope(
        &self,
        api_key_id: i64,
        server_id: Option<i64>,
        stack_pattern: &str,
        permission_id: i64,
    ) -> Result<ApiKeyScope>;
    fn list_api_key_scopes(&self, api_key_id: i64) -> Result<Vec<ApiKeyScope>>;
    fn delete_api_key_scope(&self, api_key_id: i64, scope_id: i64) -> Result<bool>;
}

/// Queue rows, operation-log headers and their message streams.
pub trait OperationStore: Send + Sync {
    fn create_queued_operation(&self, op: &QueuedOperation) -> Result<i64>;
    fn get_queued_operation(&self, operation_id: &str) -> Result<Option<QueuedOperation>>;
    fn update_queued_operation_status(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// Rows with `status`, oldest first.
    fn list_queued_operations_by_status(&self, status: OperationStatus)
    -> Result<Vec<QueuedOperation>>;
    /// Queued and running rows for one stack, in dispatch order.
    fn list_stack_queue(&self, server_id: i64, stack_name: &str) -> Result<Vec<QueuedOperation>>;
    /// Number of queued rows for the stack at or ahead of `op`.
    fn queue_position(&self, op: &QueuedOperation) -> Result<i64>;
    fn find_batch_member(&self, batch_id: &str, order_index: i32)
    -> Result<Option<QueuedOperation>>;

    fn create_operation_log(&self, log: &NewOperationLog) -> Result<i64>;
    fn get_operation_log(&self, id: i64) -> Result<Option<OperationLog>>;
    fn get_operation_log_by_operation_id(&self, operation_id: &str) -> Result<Option<OperationLog>>;
    /// Appends a message with the next dense sequence number and bumps the
    /// header's `last_message_at`. Returns the sequence number.
    fn append_operation_message(
        &self,
        log_id: i64,
        message_type: MessageType,
        data: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64>;
    fn finalize_operation_log(
        &self,
        log_id: i64,
        status: OperationStatus,
        end_time: DateTime<Utc>,
        success: bool,
        exit_code: Option<i32>,
    ) -> Result<()>;
    fn list_operation_logs(
        &self,
        filter: &OperationLogFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<OperationLog>, i64)>;
    fn list_operation_messages(&self, log_id: i64) -> Result<Vec<OperationLogMessage>>;
    /// Non-terminal headers with a heartbeat after `cutoff`.
    fn running_operation_logs(
        &self,
        user_id: Option<i64>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OperationLog>>;
    /// Non-terminal headers silent since before `cutoff`.
    fn stale_operation_logs(&self, cutoff: DateTime<Utc>) -> Result<Vec<OperationLog>>;
    fn operation_log_stats(&self, user_id: Option<i64>) -> Result<OperationLogStats>;
}

pub trait WebhookStore: Send + Sync {
    fn create_webhook(&self, webhook: &NewWebhook, server_ids: &[i64]) -> Result<Webhook>;
    fn get_webhook(&self, id: i64) -> Result<Option<Webhook>>;
    fn list_webhooks(&self, user_id: Option<i64>) -> Result<Vec<Webhook>>;
    /// Updates mutable fields; replaces server scopes when `server_ids` is given.
    fn update_webhook(&self, webhook: &Webhook, server_ids: Option<&[i64]>) -> Result<()>;
    fn update_webhook_key(&self, id: i64, api_key_hash: &str, key_prefix: &str) -> Result<()>;
    fn delete_webhook(&self, id: i64) -> Result<bool>;
    fn record_webhook_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

pub trait AuditStore: Send + Sync {
    fn insert_security_audit(&self, event: &NewSecurityAudit) -> Result<i64>;
    fn get_security_audit(&self, id: i64) -> Result<Option<SecurityAuditLog>>;
    fn list_security_audit(
        &self,
        filter: &SecurityAuditFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<SecurityAuditLog>, i64)>;
    fn security_audit_stats(&self) -> Result<SecurityAuditStats>;
}

/// Store defines the database interface.
pub trait Store: IdentityStore + OperationStore + WebhookStore + AuditStore {
    fn initialize(&self) -> Result<()>;

    /// Seeds the permission catalogue. Idempotent.
    fn seed_permissions(&self) -> Result<()> {
        for def in permission::CATALOGUE {
            self.upsert_permission(def)?;
        }
        Ok(())
    }

    fn has_admin_user(&self) -> Result<bool>;
}
