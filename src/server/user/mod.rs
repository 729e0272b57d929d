pub mod access;
mod api_keys;
mod operation_logs;
mod operations;
mod stacks;
mod webhooks;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use crate::server::AppState;

pub fn user_router() -> Router<Arc<AppState>> {
    Router::new()
        // Servers and the stack proxy
        .route("/servers", get(stacks::list_servers))
        .route("/servers/{server_id}/stacks", get(stacks::list_stacks))
        .route(
            "/servers/{server_id}/stacks/{stack}",
            get(stacks::get_stack),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/logs",
            get(stacks::stack_logs),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/files",
            get(stacks::list_files),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/files/read",
            get(stacks::read_file),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/files/write",
            post(stacks::write_file),
        )
        .route(
            "/servers/{server_id}/maintenance/info",
            get(stacks::maintenance_info),
        )
        .route(
            "/servers/{server_id}/maintenance/prune",
            post(stacks::maintenance_prune),
        )
        // Operations
        .route(
            "/servers/{server_id}/stacks/{stack}/operations",
            post(operations::start_operation),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/permissions",
            get(operations::stack_permissions),
        )
        .route(
            "/servers/{server_id}/stacks/{stack}/queue",
            get(operations::stack_queue),
        )
        // Operation logs
        .route("/operation-logs", get(operation_logs::list_operation_logs))
        .route(
            "/operation-logs/stats",
            get(operation_logs::operation_log_stats),
        )
        .route(
            "/operation-logs/{id}",
            get(operation_logs::get_operation_log),
        )
        .route(
            "/running-operations",
            get(operation_logs::running_operations),
        )
        // API keys
        .route("/api-keys", get(api_keys::list_api_keys))
        .route("/api-keys", post(api_keys::create_api_key))
        .route("/api-keys/{id}", get(api_keys::get_api_key))
        .route("/api-keys/{id}", delete(api_keys::delete_api_key))
        .route("/api-keys/{id}/scopes", get(api_keys::list_scopes))
        .route("/api-keys/{id}/scopes", post(api_keys::add_scope))
        .route(
            "/api-keys/{id}/scopes/{scope_id}",
            delete(api_keys::delete_scope),
        )
        // Webhooks
        .route("/webhooks", get(webhooks::list_webhooks))
        .route("/webhooks", post(webhooks::create_webhook))
        .route("/webhooks/{id}", get(webhooks::get_webhook))
        .route("/webhooks/{id}", patch(webhooks::update_webhook))
        .route("/webhooks/{id}", delete(webhooks::delete_webhook))
        .route(
            "/webhooks/{id}/regenerate",
            post(webhooks::regenerate_webhook),
        )
        .route("/webhooks/{id}/trigger", post(webhooks::trigger_webhook))
}
