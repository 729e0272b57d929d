use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::{ClientInfo, RequireAuth, RequireSession};
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_stack_pattern;
use crate::webhook::{CreateWebhook, TriggerRequest, UpdateWebhook};

pub async fn list_webhooks(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let webhooks = state.webhooks.list(ctx.user.id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(webhooks)))
}

pub async fn create_webhook(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<CreateWebhook>,
) -> impl IntoResponse {
    validate_stack_pattern(&req.stack_pattern)?;
    let issued = state.webhooks.create(ctx.user.id, req, &meta)?;
    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(issued))))
}

pub async fn get_webhook(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let webhook = state.webhooks.get(ctx.user.id, id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(webhook)))
}

pub async fn update_webhook(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWebhook>,
) -> impl IntoResponse {
    if let Some(pattern) = &req.stack_pattern {
        validate_stack_pattern(pattern)?;
    }
    let webhook = state.webhooks.update(ctx.user.id, id, req, &meta)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(webhook)))
}

pub async fn regenerate_webhook(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let issued = state.webhooks.regenerate(ctx.user.id, id, &meta)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(issued)))
}

pub async fn delete_webhook(
    RequireSession(ctx): RequireSession,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.webhooks.delete(ctx.user.id, id, &meta)?;
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Unauthenticated: the webhook key travels in the body.
pub async fn trigger_webhook(
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<TriggerRequest>,
) -> impl IntoResponse {
    let outcome = state.webhooks.trigger(id, req, &meta).await?;
    Ok::<_, ApiError>(Json(ApiResponse::success(outcome)))
}
