use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ApiKey, ApiKeyScope, Role, User};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub user: UserResponse,
    pub totp_required: bool,
    pub temporary_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<Role>,
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
pub struct StackPermissionRequest {
    pub server_id: i64,
    pub permission: String,
    pub stack_pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub skip_ssl_verification: bool,
    pub access_token: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub skip_ssl_verification: Option<bool>,
    pub access_token: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<ScopeRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ScopeRequest {
    #[serde(default)]
    pub server_id: Option<i64>,
    pub stack_pattern: String,
    pub permission: String,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    #[serde(flatten)]
    pub key: ApiKey,
    pub scopes: Vec<ApiKeyScope>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    /// Shown once.
    pub api_key: String,
    pub metadata: ApiKeyResponse,
}

#[derive(Debug, Serialize)]
pub struct PermissionsResponse {
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStartedResponse {
    pub operation_id: String,
    pub position_in_queue: i64,
}

/// Either a single compose command or an ordered batch.
#[derive(Debug, Deserialize)]
pub struct OperationBody {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub operations: Option<Vec<crate::types::OperationRequest>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OperationLogQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub search: Option<String>,
    pub server_id: Option<i64>,
    pub stack_name: Option<String>,
    pub command: Option<String>,
    pub status: Option<String>,
    pub days_back: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub event_type: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
    pub actor_user_id: Option<i64>,
    pub success: Option<bool>,
}

const fn default_true() -> bool {
    true
}
