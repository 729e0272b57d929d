use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::audit::{CATEGORY_API_KEY, RequestMeta};
use crate::auth::{ClientInfo, RequireAuth, RequireSession, generate_api_key};
use crate::server::AppState;
use crate::server::dto::{ApiKeyResponse, CreateApiKeyRequest, CreateApiKeyResponse, ScopeRequest};
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_stack_pattern;
use crate::store::{NewApiKey, NewApiKeyScope};
use crate::types::{ApiKey, ApiKeyScope};

/// Validates a scope request and checks the user may grant it.
fn check_scope(state: &AppState, user_id: i64, req: &ScopeRequest) -> Result<NewApiKeyScope, ApiError> {
    validate_stack_pattern(&req.stack_pattern)?;
    let permission = state
        .store
        .get_permission_by_name(&req.permission)?
        .ok_or_else(|| ApiError::bad_request(format!("unknown permission '{}'", req.permission)))?;
    if let Some(server_id) = req.server_id {
        if state.store.get_server(server_id)?.is_none() {
            return Err(ApiError::bad_request(format!("server {server_id} does not exist")));
        }
    }
    state
        .authorizer
        .check_scope_grant(user_id, req.server_id, &req.stack_pattern, &permission)?;

    Ok(NewApiKeyScope {
        server_id: req.server_id,
        stack_pattern: req.stack_pattern.clone(),
        permission_id: permission.id,
    })
}

fn owned_key(state: &AppState, user_id: i64, id: i64) -> Result<ApiKey, ApiError> {
    state
        .store
        .get_api_key(id)?
        .filter(|k| k.user_id == user_id && k.is_active)
        .ok_or_else(|| ApiError::not_found("API key not found"))
}

fn key_response(state: &AppState, key: ApiKey) -> Result<ApiKeyResponse, ApiError> {
    let scopes = state.store.list_api_key_scopes(key.id)?;
    Ok(ApiKeyResponse { key, scopes })
}

fn audit_key(state: &AppState, event: &str, user_id: i64, key: &ApiKey, meta: &RequestMeta) {
    state.audit.mutation(
        CATEGORY_API_KEY,
        event,
        user_id,
        "api_key",
        Some(key.id),
        Some(&key.name),
        meta,
    );
}

pub async fn list_api_keys(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let keys = state
        .store
        .list_user_api_keys(ctx.user.id)?
        .into_iter()
        .map(|k| key_response(&state, k))
        .collect::<Result<Vec<_>, _>>()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(keys)))
}

pub async fn create_api_key(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<CreateApiKeyRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    if req.expires_at.is_some_and(|exp| exp <= Utc::now()) {
        return Err(ApiError::bad_request("expires_at must be in the future"));
    }
    let new_scopes = req
        .scopes
        .iter()
        .map(|s| check_scope(&state, ctx.user.id, s))
        .collect::<Result<Vec<_>, _>>()?;

    let generated = generate_api_key();
    let (key, scopes) = state.store.create_api_key_with_scopes(
        &NewApiKey {
            user_id: ctx.user.id,
            name: name.to_string(),
            key_hash: generated.hash,
            key_prefix: generated.prefix,
            expires_at: req.expires_at,
        },
        &new_scopes,
    )?;

    audit_key(&state, "api_key_created", ctx.user.id, &key, &meta);
    tracing::info!(api_key_id = key.id, user_id = ctx.user.id, "api key created");

    let metadata = ApiKeyResponse { key, scopes };
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateApiKeyResponse {
            api_key: generated.plaintext,
            metadata,
        })),
    ))
}

pub async fn get_api_key(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, ctx.user.id, id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(key_response(&state, key)?)))
}

pub async fn delete_api_key(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, ctx.user.id, id)?;
    state.store.soft_delete_api_key(key.id, Utc::now())?;
    audit_key(&state, "api_key_deleted", ctx.user.id, &key, &meta);
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_scopes(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let key = owned_key(&state, ctx.user.id, id)?;
    let scopes: Vec<ApiKeyScope> = state.store.list_api_key_scopes(key.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(scopes)))
}

pub async fn add_scope(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<ScopeRequest>,
) -> impl IntoResponse {
    let key = owned_key(&state, ctx.user.id, id)?;
    let scope = check_scope(&state, ctx.user.id, &req)?;
    let created = state.store.create_api_key_scope(
        key.id,
        scope.server_id,
        &scope.stack_pattern,
        scope.permission_id,
    )?;
    audit_key(&state, "api_key_scope_added", ctx.user.id, &key, &meta);
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

pub async fn delete_scope(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((id, scope_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    let key = owned_key(&state, ctx.user.id, id)?;
    if !state.store.delete_api_key_scope(key.id, scope_id)? {
        return Err(ApiError::not_found("Scope not found"));
    }
    audit_key(&state, "api_key_scope_removed", ctx.user.id, &key, &meta);
    Ok(StatusCode::NO_CONTENT)
}
