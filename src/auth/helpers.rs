use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::token::{self, CredentialKind, sha256_hex};
use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::rbac::Principal;
use crate::store::Store;
use crate::types::{ApiKey, Session, User};

#[derive(Debug, PartialEq, Eq)]
pub enum TokenValidationError {
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    InternalError,
}

/// An authenticated request: who the user is and which credential they
/// presented.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub principal: Principal,
}

/// Tokens handed to a client at login or refresh.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    #[serde(skip)]
    pub session: Session,
}

/// Pulls a bearer token out of an Authorization header.
/// `Ok(None)` means no header was sent.
pub fn extract_bearer(auth_header: Option<&str>) -> std::result::Result<Option<String>, TokenValidationError> {
    match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
            Some(_) => Err(TokenValidationError::InvalidToken),
            None => Err(TokenValidationError::InvalidScheme),
        },
        None => Ok(None),
    }
}

/// Resolves a raw bearer credential (session access token or API key).
pub fn authenticate(
    store: &dyn Store,
    raw_token: &str,
) -> std::result::Result<AuthContext, TokenValidationError> {
    let kind = token::credential_kind(raw_token).map_err(|_| TokenValidationError::InvalidToken)?;
    let now = Utc::now();

    let (user_id, principal) = match kind {
        CredentialKind::Session => {
            let session = store
                .get_session_by_access_hash(&sha256_hex(raw_token))
                .map_err(|_| TokenValidationError::InternalError)?
                .ok_or(TokenValidationError::InvalidToken)?;
            if session.access_expires_at <= now {
                return Err(TokenValidationError::TokenExpired);
            }
            (
                session.user_id,
                Principal::Session {
                    user_id: session.user_id,
                    session_id: session.id,
                },
            )
        }
        CredentialKind::ApiKey => {
            let key = validate_api_key(store, raw_token, now)?;
            let scopes = store
                .list_api_key_scopes(key.id)
                .map_err(|_| TokenValidationError::InternalError)?;
            (
                key.user_id,
                Principal::ApiKey {
                    user_id: key.user_id,
                    key,
                    scopes,
                },
            )
        }
    };

    let user = store
        .get_user(user_id)
        .map_err(|_| TokenValidationError::InternalError)?
        .ok_or(TokenValidationError::InvalidToken)?;

    Ok(AuthContext { user, principal })
}

/// Looks an API key up by hash and bumps its `last_used_at`.
pub fn validate_api_key(
    store: &dyn Store,
    raw_key: &str,
    now: DateTime<Utc>,
) -> std::result::Result<ApiKey, TokenValidationError> {
    let key = store
        .get_api_key_by_hash(&sha256_hex(raw_key))
        .map_err(|_| TokenValidationError::InternalError)?
        .ok_or(TokenValidationError::InvalidToken)?;

    if !key.is_active {
        return Err(TokenValidationError::InvalidToken);
    }
    if !key.is_usable_at(now) {
        return Err(TokenValidationError::TokenExpired);
    }

    if let Err(e) = store.touch_api_key(key.id, now) {
        tracing::warn!(api_key_id = key.id, "failed to update api key last_used_at: {e}");
    }
    Ok(key)
}

/// Creates a session for `user_id` with a fresh token pair.
pub fn issue_session(store: &dyn Store, user_id: i64, config: &AuthConfig) -> Result<IssuedSession> {
    let (access_token, refresh_token) = token::generate_session_tokens();
    let now = Utc::now();
    let session = store.create_session(
        user_id,
        &sha256_hex(&access_token),
        &sha256_hex(&refresh_token),
        now + Duration::seconds(config.access_token_ttl_secs),
        now + Duration::seconds(config.refresh_token_ttl_secs),
    )?;

    Ok(IssuedSession {
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in: config.access_token_ttl_secs,
        refresh_expires_in: config.refresh_token_ttl_secs,
        session,
    })
}

/// Exchanges a refresh token for a new session. The old session is revoked
/// so each refresh token works once.
pub fn refresh_session(
    store: &dyn Store,
    raw_refresh: &str,
    config: &AuthConfig,
) -> Result<IssuedSession> {
    if !raw_refresh.starts_with(token::REFRESH_TOKEN_PREFIX) {
        return Err(Error::InvalidTokenFormat);
    }
    let session = store
        .get_session_by_refresh_hash(&sha256_hex(raw_refresh))?
        .ok_or(Error::Unauthorized)?;
    store.delete_session(session.id)?;
    if session.refresh_expires_at <= Utc::now() {
        return Err(Error::TokenExpired);
    }
    issue_session(store, session.user_id, config)
}
