use std::path::PathBuf;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Initialize the server (create database, encryption key and admin user)
    Init {
        /// Data directory for the database and key file
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Admin username
        #[arg(long)]
        username: Option<String>,

        /// Admin email
        #[arg(long)]
        email: Option<String>,

        /// Admin password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Skip interactive prompts (requires --username and --password)
        #[arg(long)]
        non_interactive: bool,
    },
}

#[derive(Subcommand)]
pub enum WebhookCommands {
    /// Trigger a webhook and report the queued operation ids.
    ///
    /// Flags are validated here rather than by clap so that a missing flag
    /// exits with 7 instead of colliding with the auth exit code.
    Trigger {
        /// Base URL of the Berth server
        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        webhook_id: Option<i64>,

        /// Webhook key (`wh_...`)
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        server_id: Option<i64>,

        #[arg(long)]
        stack: Option<String>,

        /// Single compose command, e.g. `up`
        #[arg(long)]
        command: Option<String>,

        /// Option passed to the command (repeatable)
        #[arg(long = "option", allow_hyphen_values = true)]
        options: Vec<String>,

        /// Service to target (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,

        /// JSON array of `{command, options?, services?}` run as a batch
        #[arg(long)]
        operations: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}
