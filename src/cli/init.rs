use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::auth::SecretHasher;
use crate::config::ServerConfig;
use crate::crypto::SecretBox;
use crate::server::validation::{validate_password, validate_username};
use crate::store::{IdentityStore, SqliteStore, Store};

pub const ADMIN_ROLE: &str = "admin";

pub struct InitOptions {
    pub data_dir: PathBuf,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub non_interactive: bool,
}

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn set_restrictive_permissions(_path: &Path) {}

/// Writes a fresh encryption key unless one already exists.
fn ensure_encryption_key(config: &ServerConfig) -> anyhow::Result<bool> {
    let path = config.encryption_key_path();
    if config.encryption_key.is_some() || path.exists() {
        return Ok(false);
    }
    fs::write(&path, SecretBox::generate_key())
        .with_context(|| format!("failed to write {}", path.display()))?;
    set_restrictive_permissions(&path);
    Ok(true)
}

fn prompt_username() -> anyhow::Result<String> {
    Ok(inquire::Text::new("Admin username:")
        .with_default("admin")
        .with_validator(|input: &str| {
            Ok(match validate_username(input) {
                Ok(()) => inquire::validator::Validation::Valid,
                Err(e) => inquire::validator::Validation::Invalid(e.message.into()),
            })
        })
        .prompt()?)
}

fn prompt_password() -> anyhow::Result<String> {
    Ok(inquire::Password::new("Admin password:")
        .with_validator(|input: &str| {
            Ok(match validate_password(input) {
                Ok(()) => inquire::validator::Validation::Valid,
                Err(e) => inquire::validator::Validation::Invalid(e.message.into()),
            })
        })
        .prompt()?)
}

/// Creates the database, seeds the permission catalogue and bootstraps the
/// admin role and first admin user.
pub fn run_init(options: InitOptions) -> anyhow::Result<()> {
    fs::create_dir_all(&options.data_dir)?;
    let config = ServerConfig {
        data_dir: options.data_dir.clone(),
        ..ServerConfig::default()
    };

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    store.seed_permissions()?;

    if store.has_admin_user()? {
        bail!(
            "Server already initialized: {} has an admin user",
            config.db_path().display()
        );
    }

    let wrote_key = ensure_encryption_key(&config)?;

    let username = match options.username {
        Some(name) => name,
        None if options.non_interactive => bail!("--username is required with --non-interactive"),
        None => prompt_username()?,
    };
    let password = match options.password {
        Some(password) => password,
        None if options.non_interactive => bail!("--password is required with --non-interactive"),
        None => prompt_password()?,
    };
    validate_username(&username).map_err(|e| anyhow::anyhow!(e.message))?;
    validate_password(&password).map_err(|e| anyhow::anyhow!(e.message))?;
    let email = options
        .email
        .unwrap_or_else(|| format!("{username}@localhost"));

    let hash = SecretHasher::new().hash(&password)?;
    let role = match store.get_role_by_name(ADMIN_ROLE)? {
        Some(role) => role,
        None => store.create_role(ADMIN_ROLE, Some("Full administrative access"), true)?,
    };
    let user = store.create_user(&username, &email, &hash)?;
    store.assign_role(user.id, role.id)?;

    println!();
    println!("========================================");
    println!("Database:       {}", config.db_path().display());
    if wrote_key {
        println!("Encryption key: {}", config.encryption_key_path().display());
    }
    println!("Admin user:     {username}");
    println!("========================================");
    println!();

    Ok(())
}
