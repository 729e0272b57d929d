use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::server::AppState;
use crate::server::dto::AuditQuery;
use crate::server::response::{
    ApiError, ApiResponse, PaginatedResponse, PaginationParams, StoreOptionExt,
};
use crate::store::SecurityAuditFilter;

pub async fn list_audit_logs(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    let filter = SecurityAuditFilter {
        event_type: query.event_type.filter(|s| !s.is_empty()),
        category: query.category.filter(|s| !s.is_empty()),
        severity: query.severity.filter(|s| !s.is_empty()),
        actor_user_id: query.actor_user_id,
        success: query.success,
    };
    let (page, page_size) = PaginationParams {
        page: query.page,
        page_size: query.page_size,
    }
    .resolve();

    let (events, total) = state
        .store
        .list_security_audit(&filter, page, page_size)?;
    Ok::<_, ApiError>(Json(PaginatedResponse::new(events, total, page, page_size)))
}

pub async fn get_audit_log(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let event = state
        .store
        .get_security_audit(id)?
        .or_not_found("Audit event not found")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(event)))
}

pub async fn audit_stats(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let stats = state.store.security_audit_stats()?;
    Ok::<_, ApiError>(Json(ApiResponse::success(stats)))
}
