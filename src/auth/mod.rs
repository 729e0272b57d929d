mod helpers;
mod middleware;
pub mod token;

pub use helpers::{
    AuthContext, IssuedSession, TokenValidationError, authenticate, extract_bearer, issue_session,
    refresh_session, validate_api_key,
};
pub use middleware::{AuthError, ClientInfo, RequireAdmin, RequireAuth, RequireSession};
pub use token::{SecretHasher, generate_api_key, sha256_hex};
