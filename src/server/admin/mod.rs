mod audit;
mod roles;
mod servers;
mod users;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // Server routes
        .route("/servers", post(servers::create_server))
        .route("/servers", get(servers::list_servers))
        .route("/servers/{id}", get(servers::get_server))
        .route("/servers/{id}", patch(servers::update_server))
        .route("/servers/{id}", delete(servers::delete_server))
        .route("/servers/{id}/test", post(servers::test_connection))
        // User routes
        .route("/users", post(users::create_user))
        .route("/users", get(users::list_users))
        .route("/users/{id}", get(users::get_user))
        .route("/users/{id}", delete(users::delete_user))
        .route("/users/{id}/roles", post(users::assign_role))
        .route("/users/{id}/roles/{role_id}", delete(users::remove_role))
        // Role routes
        .route("/roles", post(roles::create_role))
        .route("/roles", get(roles::list_roles))
        .route("/roles/{id}", delete(roles::delete_role))
        .route(
            "/roles/{id}/stack-permissions",
            get(roles::list_stack_permissions),
        )
        .route(
            "/roles/{id}/stack-permissions",
            post(roles::add_stack_permission),
        )
        .route(
            "/roles/{id}/stack-permissions/{grant_id}",
            delete(roles::delete_stack_permission),
        )
        .route("/permissions", get(roles::list_permissions))
        // Security audit
        .route("/audit-logs", get(audit::list_audit_logs))
        .route("/audit-logs/stats", get(audit::audit_stats))
        .route("/audit-logs/{id}", get(audit::get_audit_log))
}
