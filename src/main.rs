use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use berth::cli::{
    AdminCommands, InitOptions, ServeOptions, TriggerArgs, WebhookCommands, run_init, run_serve,
    run_webhook_trigger,
};

/// Exit code for arguments clap could not parse.
const USAGE_EXIT: u8 = 7;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "A control plane for compose stacks on remote agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// TOML config file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory for the database and key file
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Webhook commands
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init {
                data_dir,
                username,
                email,
                password,
                non_interactive,
            } => run_init(InitOptions {
                data_dir,
                username,
                email,
                password,
                non_interactive,
            })?,
        },
        Commands::Serve {
            config,
            host,
            port,
            data_dir,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_serve(ServeOptions {
                config,
                host,
                port,
                data_dir,
            }))?;
        }
        Commands::Webhook { command } => match command {
            WebhookCommands::Trigger {
                url,
                webhook_id,
                api_key,
                server_id,
                stack,
                command,
                options,
                services,
                operations,
                timeout,
            } => {
                let code = run_webhook_trigger(TriggerArgs {
                    url,
                    webhook_id,
                    api_key,
                    server_id,
                    stack,
                    command,
                    options,
                    services,
                    operations,
                    timeout,
                });
                return Ok(ExitCode::from(u8::try_from(code).unwrap_or(USAGE_EXIT)));
            }
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("berth=info".parse()?))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return Ok(ExitCode::from(USAGE_EXIT));
        }
        Err(e) => e.exit(),
    };

    run(cli)
}
