use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::audit::CATEGORY_ADMIN;
use crate::auth::{ClientInfo, RequireAdmin};
use crate::server::AppState;
use crate::server::dto::{CreateRoleRequest, StackPermissionRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt};
use crate::server::validation::validate_stack_pattern;

pub async fn create_role(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<CreateRoleRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let role = state
        .store
        .create_role(name, req.description.as_deref(), req.is_admin)?;
    state.audit.mutation(
        CATEGORY_ADMIN,
        "role_created",
        ctx.user.id,
        "role",
        Some(role.id),
        Some(&role.name),
        &meta,
    );
    Ok((StatusCode::CREATED, Json(ApiResponse::success(role))))
}

pub async fn list_roles(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let roles = state.store.list_roles()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(roles)))
}

/// Cascades to the role's stack grants and assignments.
pub async fn delete_role(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let role = state.store.get_role(id)?.or_not_found("Role not found")?;
    state.store.delete_role(role.id)?;
    state.audit.mutation(
        CATEGORY_ADMIN,
        "role_deleted",
        ctx.user.id,
        "role",
        Some(role.id),
        Some(&role.name),
        &meta,
    );
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_stack_permissions(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let role = state.store.get_role(id)?.or_not_found("Role not found")?;
    let grants = state.store.list_role_stack_permissions(role.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(grants)))
}

pub async fn add_stack_permission(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<StackPermissionRequest>,
) -> impl IntoResponse {
    validate_stack_pattern(&req.stack_pattern)?;
    let role = state.store.get_role(id)?.or_not_found("Role not found")?;
    if state.store.get_server(req.server_id)?.is_none() {
        return Err(ApiError::bad_request(format!(
            "server {} does not exist",
            req.server_id
        )));
    }
    let permission = state
        .store
        .get_permission_by_name(&req.permission)?
        .ok_or_else(|| ApiError::bad_request(format!("unknown permission '{}'", req.permission)))?;
    if permission.is_api_key_only || permission.is_admin_permission() {
        return Err(ApiError::bad_request(format!(
            "{} cannot be granted per stack",
            permission.name
        )));
    }

    let grant = state.store.create_stack_permission(
        req.server_id,
        role.id,
        permission.id,
        &req.stack_pattern,
    )?;
    state.audit.mutation(
        CATEGORY_ADMIN,
        "stack_permission_granted",
        ctx.user.id,
        "role",
        Some(role.id),
        Some(&role.name),
        &meta,
    );
    Ok((StatusCode::CREATED, Json(ApiResponse::success(grant))))
}

pub async fn delete_stack_permission(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((id, grant_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let role = state.store.get_role(id)?.or_not_found("Role not found")?;
    if !state.store.delete_stack_permission(role.id, grant_id)? {
        return Err(ApiError::not_found("Stack permission not found"));
    }
    state.audit.mutation(
        CATEGORY_ADMIN,
        "stack_permission_revoked",
        ctx.user.id,
        "role",
        Some(role.id),
        Some(&role.name),
        &meta,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_permissions(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let permissions = state.store.list_permissions()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(permissions)))
}
