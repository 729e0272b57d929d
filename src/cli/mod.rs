mod commands;
pub mod http_client;
mod init;
mod serve;
mod webhook;

pub use commands::{AdminCommands, WebhookCommands};
pub use init::{ADMIN_ROLE, InitOptions, run_init};
pub use serve::{ServeOptions, resolve_config, run_serve};
pub use webhook::{TriggerArgs, run_webhook_trigger};
