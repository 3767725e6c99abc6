mod commands;
#[cfg(feature = "reset")]
mod confirm;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqlshift", version, about = "Forward-only SQL schema migrations")]
pub struct Cli {
    /// Config file (YAML or TOML)
    #[arg(long, short, global = true, env = "SQLSHIFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory containing migration scripts (overrides config)
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List migrations that have not been applied yet. Never modifies the schema.
    CheckPending {
        /// Print the list as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Apply all pending migrations in order
    Run,
    /// Show every migration with its applied / pending / drift state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove a migration lock left behind by a crashed run
    Unlock,
    /// Run the startup hook the way the application does at boot
    Startup,
    /// Destructive: clear the ledger and/or drop the managed schema
    #[cfg(feature = "reset")]
    Reset {
        #[arg(long, value_parser = commands::parse_reset_mode)]
        mode: sqlshift_db::ResetMode,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match commands::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
