use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;

use crate::audit::{CATEGORY_ADMIN, RequestMeta};
use crate::auth::{ClientInfo, RequireAdmin};
use crate::server::AppState;
use crate::server::dto::{CreateServerRequest, UpdateServerRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt};
use crate::server::validation::validate_server_name;
use crate::store::NewServer;
use crate::types::Server;

#[derive(Serialize)]
struct ConnectionStatus {
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn validate_endpoint(host: &str, port: u16) -> Result<(), ApiError> {
    if host.trim().is_empty() {
        return Err(ApiError::bad_request("host is required"));
    }
    if host.contains('/') || host.contains(' ') {
        return Err(ApiError::bad_request("host must be a bare hostname or address"));
    }
    if port == 0 {
        return Err(ApiError::bad_request("port must be non-zero"));
    }
    Ok(())
}

fn audit_server(state: &AppState, event: &str, actor: i64, server: &Server, meta: &RequestMeta) {
    state.audit.mutation(
        CATEGORY_ADMIN,
        event,
        actor,
        "server",
        Some(server.id),
        Some(&server.name),
        meta,
    );
}

pub async fn create_server(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<CreateServerRequest>,
) -> impl IntoResponse {
    validate_server_name(&req.name)?;
    validate_endpoint(&req.host, req.port)?;
    if req.access_token.is_empty() {
        return Err(ApiError::bad_request("access_token is required"));
    }

    let sealed = state.agent.secrets().encrypt(&req.access_token)?;
    let server = state.store.create_server(&NewServer {
        name: req.name,
        description: req.description,
        host: req.host.trim().to_string(),
        port: req.port,
        skip_ssl_verification: req.skip_ssl_verification,
        access_token: sealed,
        is_active: req.is_active,
    })?;

    audit_server(&state, "server_created", ctx.user.id, &server, &meta);
    tracing::info!(server_id = server.id, name = %server.name, "server registered");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(server))))
}

pub async fn list_servers(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let servers = state.store.list_servers()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(servers)))
}

pub async fn get_server(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let server = state.store.get_server(id)?.or_not_found("Server not found")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(server)))
}

pub async fn update_server(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateServerRequest>,
) -> impl IntoResponse {
    let mut server = state.store.get_server(id)?.or_not_found("Server not found")?;

    if let Some(name) = req.name {
        validate_server_name(&name)?;
        server.name = name;
    }
    if let Some(description) = req.description {
        server.description = Some(description).filter(|d| !d.is_empty());
    }
    if let Some(host) = req.host {
        server.host = host.trim().to_string();
    }
    if let Some(port) = req.port {
        server.port = port;
    }
    validate_endpoint(&server.host, server.port)?;
    if let Some(skip) = req.skip_ssl_verification {
        server.skip_ssl_verification = skip;
    }
    if let Some(token) = req.access_token.filter(|t| !t.is_empty()) {
        server.access_token = state.agent.secrets().encrypt(&token)?;
    }
    if let Some(is_active) = req.is_active {
        server.is_active = is_active;
    }

    state.store.update_server(&server)?;
    audit_server(&state, "server_updated", ctx.user.id, &server, &meta);
    let server = state.store.get_server(id)?.or_not_found("Server not found")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(server)))
}

pub async fn delete_server(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let server = state.store.get_server(id)?.or_not_found("Server not found")?;
    state.store.delete_server(server.id)?;
    audit_server(&state, "server_deleted", ctx.user.id, &server, &meta);
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Probes the agent's health endpoint. Unreachable agents are reported in
/// the body rather than as an error status.
pub async fn test_connection(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let server = state.store.get_server(id)?.or_not_found("Server not found")?;
    let status = match state.agent.health(&state.cancel, &server).await {
        Ok(()) => ConnectionStatus {
            healthy: true,
            error: None,
        },
        Err(e) => ConnectionStatus {
            healthy: false,
            error: Some(e.to_string()),
        },
    };
    Ok::<_, ApiError>(Json(ApiResponse::success(status)))
}
