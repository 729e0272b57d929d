use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts},
    http::{
        HeaderValue, StatusCode,
        header::{AUTHORIZATION, USER_AGENT, WWW_AUTHENTICATE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::helpers::{AuthContext, TokenValidationError, authenticate, extract_bearer};
use crate::audit::RequestMeta;
use crate::rbac::Principal;
use crate::server::AppState;

/// Extractor that requires any valid credential.
pub struct RequireAuth(pub AuthContext);

/// Extractor that requires an administrator. API keys additionally need an
/// `admin.*` scope.
pub struct RequireAdmin(pub AuthContext);

/// Extractor that requires an interactive session. Minting or changing
/// credentials is not something an API key may do for itself.
pub struct RequireSession(pub AuthContext);

/// Caller address and user agent, for audit records.
pub struct ClientInfo(pub RequestMeta);

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    NotAdmin,
    SessionRequired,
    InternalError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidScheme => (StatusCode::UNAUTHORIZED, "Invalid authorization scheme"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin access required"),
            AuthError::SessionRequired => {
                (StatusCode::FORBIDDEN, "Interactive session required")
            }
            AuthError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = json!({ "data": null, "error": message });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"berth\""),
            );
        }

        response
    }
}

impl From<TokenValidationError> for AuthError {
    fn from(e: TokenValidationError) -> Self {
        match e {
            TokenValidationError::InvalidScheme => AuthError::InvalidScheme,
            TokenValidationError::InvalidToken => AuthError::InvalidToken,
            TokenValidationError::TokenExpired => AuthError::TokenExpired,
            TokenValidationError::InternalError => AuthError::InternalError,
        }
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = extract_and_validate(parts, state)?;
        Ok(RequireAuth(ctx))
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = extract_and_validate(parts, state)?;

        let is_admin = state
            .authorizer
            .user_is_admin(ctx.user.id)
            .map_err(|_| AuthError::InternalError)?;
        if !is_admin {
            return Err(AuthError::NotAdmin);
        }
        if let Principal::ApiKey { scopes, .. } = &ctx.principal {
            if !scopes.iter().any(|s| s.permission_name.starts_with("admin.")) {
                return Err(AuthError::NotAdmin);
            }
        }

        Ok(RequireAdmin(ctx))
    }
}

impl FromRequestParts<Arc<AppState>> for RequireSession {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = extract_and_validate(parts, state)?;
        if !matches!(ctx.principal, Principal::Session { .. }) {
            return Err(AuthError::SessionRequired);
        }
        Ok(RequireSession(ctx))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_default();
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(ClientInfo(RequestMeta { ip, user_agent }))
    }
}

/// Reads the credential from the Authorization header, falling back to a
/// `token` query parameter for WebSocket upgrades where browsers cannot set
/// headers.
fn extract_and_validate(parts: &Parts, state: &Arc<AppState>) -> Result<AuthContext, AuthError> {
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let raw_token = match extract_bearer(auth_header)? {
        Some(token) => token,
        None => query_token(parts.uri.query()).ok_or(AuthError::MissingAuth)?,
    };

    Ok(authenticate(&*state.store, &raw_token)?)
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_token() {
        assert_eq!(query_token(Some("a=1&token=brs_x%2By")), Some("brs_x+y".to_string()));
        assert_eq!(query_token(Some("token=")), None);
        assert_eq!(query_token(Some("other=1")), None);
        assert_eq!(query_token(None), None);
    }
}
