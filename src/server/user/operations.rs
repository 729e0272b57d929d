use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::access::{require_stack_permission, resolve_server};
use crate::auth::{ClientInfo, RequireAuth};
use crate::server::AppState;
use crate::server::dto::{OperationBody, PermissionsResponse};
use crate::server::response::{ApiError, ApiResponse};
use crate::server::validation::validate_stack_name;
use crate::types::OperationRequest;
use crate::types::permission::STACKS_READ;

/// Queues a compose operation, or an ordered batch when `operations` is
/// given.
pub async fn start_operation(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
    Json(body): Json<OperationBody>,
) -> impl IntoResponse {
    validate_stack_name(&stack)?;
    resolve_server(&state, &ctx.principal, server_id)?;

    let response = match (body.operations, body.command) {
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request(
                "provide either command or operations, not both",
            ));
        }
        (Some(operations), None) => {
            let batch = state
                .queue
                .enqueue_batch(&ctx.principal, server_id, &stack, &operations, &meta)
                .await?;
            serde_json::to_value(batch).map_err(crate::error::Error::from)?
        }
        (None, command) => {
            let request = OperationRequest {
                command: command.unwrap_or_default(),
                options: body.options,
                services: body.services,
            };
            let queued = state
                .queue
                .enqueue_one(&ctx.principal, server_id, &stack, &request, &meta)
                .await?;
            serde_json::to_value(queued).map_err(crate::error::Error::from)?
        }
    };

    Ok::<_, ApiError>(Json(ApiResponse::success(response)))
}

/// The caller's effective permissions on one stack.
pub async fn stack_permissions(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    Path((server_id, stack)): Path<(i64, String)>,
) -> impl IntoResponse {
    resolve_server(&state, &ctx.principal, server_id)?;
    let permissions = state
        .authorizer
        .effective_stack_permissions(&ctx.principal, server_id, &stack)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(PermissionsResponse {
        permissions,
    })))
}

/// Queued and running operations for one stack, in dispatch order.
pub async fn stack_queue(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Path((server_id, stack)): Path<(i64, String)>,
) -> impl IntoResponse {
    resolve_server(&state, &ctx.principal, server_id)?;
    require_stack_permission(&state, &ctx.principal, server_id, &stack, STACKS_READ, &meta)?;
    let rows = state.store.list_stack_queue(server_id, &stack)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(rows)))
}
