//! Read-mostly proxy onto agent endpoints, filtered by RBAC.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde_json::Value;

use super::access::{require_stack_permission, resolve_server};
use crate::auth::{ClientInfo, RequireAuth};
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_stack_name;
use crate::types::Server;
use crate::types::permission::{
    FILES_READ, FILES_WRITE, LOGS_READ, MAINTENANCE_READ, MAINTENANCE_WRITE, STACKS_READ,
};

const LOG_QUERY_KEYS: &[&str] = &["tail", "since", "timestamps"];

fn stack_endpoint(stack: &str, suffix: &str) -> String {
    format!("/stacks/{}{suffix}", urlencoding::encode(stack))
}

/// Re-encodes the allowed subset of `params` as a query string.
fn forward_query(params: &HashMap<String, String>, allowed: &[&str]) -> String {
    let pairs: Vec<String> = allowed
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .map(|value| format!("{key}={}", urlencoding::encode(value)))
        })
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

fn stack_name(stack: &Value) -> Option<&str> {
    stack.get("name").and_then(Value::as_str)
}

pub async fn list_servers(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mut servers: Vec<Server> = Vec::new();
    for id in state.authorizer.effective_server_ids(&ctx.principal)? {
        if let Some(server) = state.store.get_server(id)?.filter(|s| s.is_active) {
            servers.push(server);
        }
    }
    Ok::<_, ApiError>(Json(ApiResponse::success(servers)))
}

/// Stacks on the host the caller may read. A host whose stacks are all
/// hidden is a 403, not an empty list.
pub async fn list_stacks(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<i64>,
) -> impl IntoResponse {
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    let stacks: Vec<Value> = state
        .agent
        .get_json(&state.cancel, &server, "/stacks")
        .await?;
    let total = stacks.len();

    let mut visible = Vec::with_capacity(total);
    for stack in stacks {
        let Some(name) = stack_name(&stack) else {
            continue;
        };
        if state
            .authorizer
            .effective_allow(&ctx.principal, server_id, name, STACKS_READ)?
        {
            visible.push(stack);
        }
    }

    if total > 0 && visible.is_empty() {
        return Err(ApiError::forbidden(format!(
            "{STACKS_READ} is not granted on any stack of this server"
        )));
    }
    Ok(Json(ApiResponse::success(visible)))
}

pub async fn get_stack(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, STACKS_READ, &meta)?;
    let detail: Value = state
        .agent
        .get_json(&state.cancel, &server, &stack_endpoint(&stack, ""))
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(detail)))
}

pub async fn stack_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, LOGS_READ, &meta)?;
    let endpoint = format!(
        "{}{}",
        stack_endpoint(&stack, "/logs"),
        forward_query(&params, LOG_QUERY_KEYS)
    );
    let logs: Value = state.agent.get_json(&state.cancel, &server, &endpoint).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}

pub async fn list_files(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, FILES_READ, &meta)?;
    let endpoint = format!(
        "{}{}",
        stack_endpoint(&stack, "/files"),
        forward_query(&params, &["path"])
    );
    let listing: Value = state.agent.get_json(&state.cancel, &server, &endpoint).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(listing)))
}

pub async fn read_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    if params.get("path").is_none_or(|p| p.is_empty()) {
        return Err(ApiError::bad_request("path is required"));
    }
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, FILES_READ, &meta)?;
    let endpoint = format!(
        "{}{}",
        stack_endpoint(&stack, "/files/read"),
        forward_query(&params, &["path"])
    );
    let content: Value = state.agent.get_json(&state.cancel, &server, &endpoint).await?;
    Ok(Json(ApiResponse::success(content)))
}

pub async fn write_file(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, FILES_WRITE, &meta)?;
    let result: Value = state
        .agent
        .post_json(
            &state.cancel,
            &server,
            &stack_endpoint(&stack, "/files/write"),
            &body,
        )
        .await?;
    tracing::info!(server_id, stack = %stack, user_id = ctx.user.id, "stack file written");
    Ok::<_, ApiError>(Json(ApiResponse::success(result)))
}

/// Host-wide maintenance is checked against the all-stacks pattern.
pub async fn maintenance_info(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(server_id): Path<i64>,
) -> impl IntoResponse {
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, "*", MAINTENANCE_READ, &meta)?;
    let info: Value = state
        .agent
        .get_json(&state.cancel, &server, "/maintenance/info")
        .await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(info)))
}

pub async fn maintenance_prune(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(server_id): Path<i64>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let server = resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, "*", MAINTENANCE_WRITE, &meta)?;
    let result: Value = state
        .agent
        .post_json(&state.cancel, &server, "/maintenance/prune", &body)
        .await?;
    tracing::info!(server_id, user_id = ctx.user.id, "docker prune requested");
    Ok::<_, ApiError>(Json(ApiResponse::success(result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_query_keeps_allowed_keys() {
        let mut params = HashMap::new();
        params.insert("tail".to_string(), "100".to_string());
        params.insert("evil".to_string(), "1".to_string());
        params.insert("since".to_string(), "10m ago".to_string());

        let query = forward_query(&params, LOG_QUERY_KEYS);
        assert_eq!(query, "?tail=100&since=10m%20ago");
        assert_eq!(forward_query(&HashMap::new(), LOG_QUERY_KEYS), "");
    }

    #[test]
    fn test_stack_endpoint_encodes_name() {
        assert_eq!(stack_endpoint("a b", "/logs"), "/stacks/a%20b/logs");
    }
}
