use crate::audit::RequestMeta;
use crate::rbac::Principal;
use crate::server::AppState;
use crate::server::response::ApiError;
use crate::types::Server;

/// Loads a server the principal can reach. Servers that are missing,
/// inactive or hidden by RBAC all look the same: 404.
pub fn resolve_server(
    state: &AppState,
    principal: &Principal,
    server_id: i64,
) -> Result<Server, ApiError> {
    let server = state
        .store
        .get_server(server_id)?
        .filter(|s| s.is_active)
        .ok_or_else(|| ApiError::not_found("Server not found"))?;

    if !state.authorizer.principal_reaches_server(principal, server_id)? {
        return Err(ApiError::not_found("Server not found"));
    }
    Ok(server)
}

/// Checks `permission` on the stack, auditing a denial.
pub fn require_stack_permission(
    state: &AppState,
    principal: &Principal,
    server_id: i64,
    stack: &str,
    permission: &str,
    meta: &RequestMeta,
) -> Result<(), ApiError> {
    if state
        .authorizer
        .effective_allow(principal, server_id, stack, permission)?
    {
        return Ok(());
    }
    state
        .audit
        .authorization_denied(principal, server_id, stack, permission, meta);
    Err(ApiError::forbidden(format!(
        "{permission} required on stack {stack}"
    )))
}
