use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::auth::{ClientInfo, RequireAuth, issue_session, refresh_session};
use crate::error::Error;
use crate::rbac::Principal;
use crate::server::AppState;
use crate::server::dto::{LoginRequest, LoginResponse, RefreshRequest, UserResponse};
use crate::server::response::{ApiError, ApiResponse};
use crate::types::User;

pub(crate) fn user_response(state: &AppState, user: User) -> Result<UserResponse, ApiError> {
    let roles = state.store.list_user_roles(user.id)?;
    let is_admin = roles.iter().any(|r| r.is_admin);
    Ok(UserResponse {
        user,
        roles,
        is_admin,
    })
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let user = state.store.get_user_by_username(req.username.trim())?;

    let verified = match &user {
        Some(user) => {
            let hasher = state.hasher.clone();
            let password = req.password.clone();
            let hash = user.password_hash.clone();
            tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
                .await
                .map_err(|_| ApiError::internal("password verification failed"))?
                .unwrap_or(false)
        }
        None => false,
    };

    let Some(user) = user.filter(|_| verified) else {
        state.audit.auth_event(
            "login_failed",
            None,
            false,
            Some("invalid username or password"),
            &meta,
        );
        return Err(ApiError::unauthorized("invalid username or password"));
    };

    let issued = issue_session(&*state.store, user.id, &state.config.auth)?;
    state
        .audit
        .auth_event("login_success", Some(user.id), true, None, &meta);
    tracing::info!(user_id = user.id, "user logged in");

    let user = user_response(&state, user)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(LoginResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: issued.token_type,
        expires_in: issued.expires_in,
        refresh_expires_in: issued.refresh_expires_in,
        user,
        totp_required: false,
        temporary_token: None,
    })))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    match refresh_session(&*state.store, req.refresh_token.trim(), &state.config.auth) {
        Ok(issued) => {
            state.audit.auth_event(
                "token_refreshed",
                Some(issued.session.user_id),
                true,
                None,
                &meta,
            );
            Ok(Json(ApiResponse::success(issued)))
        }
        Err(e @ (Error::Unauthorized | Error::TokenExpired | Error::InvalidTokenFormat)) => {
            state
                .audit
                .auth_event("token_refresh_failed", None, false, Some(&e.to_string()), &meta);
            Err(ApiError::unauthorized("invalid refresh token"))
        }
        Err(e) => Err(ApiError::from(e)),
    }
}

/// Revokes the calling session. API keys are revoked through their own
/// endpoint.
pub async fn logout(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
    ClientInfo(meta): ClientInfo,
) -> impl IntoResponse {
    let Principal::Session { session_id, .. } = ctx.principal else {
        return Err(ApiError::bad_request("logout requires a session token"));
    };
    state.store.delete_session(session_id)?;
    state
        .audit
        .auth_event("logout", Some(ctx.user.id), true, None, &meta);
    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn me(
    RequireAuth(ctx): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user = user_response(&state, ctx.user)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(user)))
}
