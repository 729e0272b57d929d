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
use crate::server::auth::user_response;
use crate::server::dto::{AssignRoleRequest, CreateUserRequest};
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt};
use crate::server::validation::{validate_password, validate_username};

pub async fn create_user(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    validate_username(&req.username)?;
    validate_password(&req.password)?;
    if !req.email.contains('@') {
        return Err(ApiError::bad_request("email is invalid"));
    }
    for role_id in &req.role_ids {
        if state.store.get_role(*role_id)?.is_none() {
            return Err(ApiError::bad_request(format!("role {role_id} does not exist")));
        }
    }

    let hasher = state.hasher.clone();
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
        .await
        .map_err(|_| ApiError::internal("Failed to hash password"))??;

    let user = state.store.create_user(&req.username, &req.email, &hash)?;
    for role_id in &req.role_ids {
        state.store.assign_role(user.id, *role_id)?;
    }

    state.audit.mutation(
        CATEGORY_ADMIN,
        "user_created",
        ctx.user.id,
        "user",
        Some(user.id),
        Some(&user.username),
        &meta,
    );
    let user = user_response(&state, user)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(user))))
}

pub async fn list_users(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let users = state
        .store
        .list_users()?
        .into_iter()
        .map(|u| user_response(&state, u))
        .collect::<Result<Vec<_>, _>>()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(users)))
}

pub async fn get_user(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let user = state.store.get_user(id)?.or_not_found("User not found")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(user_response(&state, user)?)))
}

pub async fn delete_user(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if id == ctx.user.id {
        return Err(ApiError::bad_request("you cannot delete your own account"));
    }
    let user = state.store.get_user(id)?.or_not_found("User not found")?;
    state.store.delete_user(user.id)?;
    state.audit.mutation(
        CATEGORY_ADMIN,
        "user_deleted",
        ctx.user.id,
        "user",
        Some(user.id),
        Some(&user.username),
        &meta,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign_role(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<AssignRoleRequest>,
) -> impl IntoResponse {
    let user = state.store.get_user(id)?.or_not_found("User not found")?;
    let role = state.store.get_role(req.role_id)?.or_not_found("Role not found")?;
    state.store.assign_role(user.id, role.id)?;
    state.audit.mutation(
        CATEGORY_ADMIN,
        "role_assigned",
        ctx.user.id,
        "user",
        Some(user.id),
        Some(&role.name),
        &meta,
    );
    Ok::<_, ApiError>(Json(ApiResponse::success(user_response(&state, user)?)))
}

pub async fn remove_role(
    RequireAdmin(ctx): RequireAdmin,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((id, role_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let user = state.store.get_user(id)?.or_not_found("User not found")?;
    if !state.store.remove_role(user.id, role_id)? {
        return Err(ApiError::not_found("User does not hold this role"));
    }
    state.audit.mutation(
        CATEGORY_ADMIN,
        "role_removed",
        ctx.user.id,
        "user",
        Some(user.id),
        None,
        &meta,
    );
    Ok(StatusCode::NO_CONTENT)
}
