use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const ARGON2_MEMORY: u32 = 64 * 1024; // 64MB
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const SECRET_BYTES: usize = 32;

pub const API_KEY_PREFIX: &str = "brth_";
pub const API_KEY_DISPLAY_LEN: usize = 13;
pub const ACCESS_TOKEN_PREFIX: &str = "brs_";
pub const REFRESH_TOKEN_PREFIX: &str = "brr_";
pub const WEBHOOK_KEY_PREFIX: &str = "wh_";
const WEBHOOK_DISPLAY_LEN: usize = 11;
const WEBHOOK_BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;

/// Which kind of bearer credential a raw string is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Session,
    ApiKey,
}

/// A freshly generated credential. `plaintext` is shown to the caller once.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

/// Slow salted hashing for passwords.
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretHasher {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .unwrap_or_default();

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Hashes a secret into a PHC string.
    pub fn hash(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| Error::Crypto(format!("failed to hash secret: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verifies a secret against a stored PHC string in constant time.
    pub fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| Error::Crypto(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(secret.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Crypto(format!("failed to verify secret: {e}"))),
        }
    }
}

fn random_bytes() -> [u8; SECRET_BYTES] {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn random_token(prefix: &str) -> String {
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(random_bytes()))
}

/// SHA-256 hex digest, used for credentials looked up by hash.
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Generates an API key: `brth_` followed by 43 URL-safe base64 characters.
#[must_use]
pub fn generate_api_key() -> GeneratedKey {
    let plaintext = random_token(API_KEY_PREFIX);
    GeneratedKey {
        prefix: plaintext[..API_KEY_DISPLAY_LEN].to_string(),
        hash: sha256_hex(&plaintext),
        plaintext,
    }
}

/// Generates an access/refresh token pair for a new session.
#[must_use]
pub fn generate_session_tokens() -> (String, String) {
    (
        random_token(ACCESS_TOKEN_PREFIX),
        random_token(REFRESH_TOKEN_PREFIX),
    )
}

/// Generates a webhook key: `wh_` followed by 64 hex characters, stored as
/// a bcrypt hash.
pub fn generate_webhook_key() -> Result<GeneratedKey> {
    let plaintext = format!("{WEBHOOK_KEY_PREFIX}{}", hex::encode(random_bytes()));
    let hash = bcrypt::hash(&plaintext, WEBHOOK_BCRYPT_COST)
        .map_err(|e| Error::Crypto(format!("failed to hash webhook key: {e}")))?;
    Ok(GeneratedKey {
        prefix: plaintext[..WEBHOOK_DISPLAY_LEN].to_string(),
        plaintext,
        hash,
    })
}

/// Checks a presented webhook key against its stored bcrypt hash.
pub fn verify_webhook_key(key: &str, hash: &str) -> Result<bool> {
    bcrypt::verify(key, hash).map_err(|e| Error::Crypto(format!("failed to verify webhook key: {e}")))
}

/// Classifies a bearer credential by its prefix.
pub fn credential_kind(raw: &str) -> Result<CredentialKind> {
    if raw.starts_with(API_KEY_PREFIX) {
        Ok(CredentialKind::ApiKey)
    } else if raw.starts_with(ACCESS_TOKEN_PREFIX) {
        Ok(CredentialKind::Session)
    } else {
        Err(Error::InvalidTokenFormat)
    }
}
