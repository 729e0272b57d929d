use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Serialize;

use crate::auth::{AuthContext, RequireAuth};
use crate::server::AppState;
use crate::server::dto::OperationLogQuery;
use crate::server::response::{ApiError, ApiResponse, PaginatedResponse, PaginationParams};
use crate::store::{OperationLogFilter, OutcomeFilter};
use crate::types::{OperationLog, OperationLogMessage};

#[derive(Serialize)]
struct OperationLogDetail {
    log: OperationLog,
    messages: Vec<OperationLogMessage>,
}

/// Administrators see every user's operations; everyone else sees their own.
fn owner_filter(state: &AppState, ctx: &AuthContext) -> Result<Option<i64>, ApiError> {
    if state.authorizer.user_is_admin(ctx.user.id)? {
        Ok(None)
    } else {
        Ok(Some(ctx.user.id))
    }
}

pub async fn list_operation_logs(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationLogQuery>,
) -> impl IntoResponse {
    let outcome = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            OutcomeFilter::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status filter '{raw}'")))?,
        ),
        None => None,
    };
    let filter = OperationLogFilter {
        user_id: owner_filter(&state, &ctx)?,
        server_id: query.server_id,
        stack_name: query.stack_name.filter(|s| !s.is_empty()),
        command: query.command.filter(|s| !s.is_empty()),
        outcome,
        days_back: query.days_back,
        search: query.search.filter(|s| !s.is_empty()),
    };
    let (page, page_size) = PaginationParams {
        page: query.page,
        page_size: query.page_size,
    }
    .resolve();

    let (logs, total) = state.store.list_operation_logs(&filter, page, page_size)?;
    Ok::<_, ApiError>(Json(PaginatedResponse::new(logs, total, page, page_size)))
}

/// Header plus every message. Accepts a numeric log id or an operation id.
pub async fn get_operation_log(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let log = match id.parse::<i64>() {
        Ok(numeric) => state.store.get_operation_log(numeric)?,
        Err(_) => state.store.get_operation_log_by_operation_id(&id)?,
    }
    .ok_or_else(|| ApiError::not_found("Operation log not found"))?;

    if let Some(owner) = owner_filter(&state, &ctx)? {
        if log.user_id != owner {
            return Err(ApiError::not_found("Operation log not found"));
        }
    }

    let messages = state.store.list_operation_messages(log.id)?;
    Ok(Json(ApiResponse::success(OperationLogDetail { log, messages })))
}

/// Operations that are still alive by heartbeat.
pub async fn running_operations(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let cutoff = Utc::now() - state.config.queue.stale_after();
    let logs = state
        .store
        .running_operation_logs(owner_filter(&state, &ctx)?, cutoff)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(logs)))
}

pub async fn operation_log_stats(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let stats = state
        .store
        .operation_log_stats(owner_filter(&state, &ctx)?)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(stats)))
}
