//! ubench: run inference servers, monitors and benchmark clients as SLURM
//! jobs and find them again by service name.
//!
//! # Usage
//!
//! ```text
//! ubench server run vllm-small
//! ubench monitor start vllm-monitor
//! ubench client run vllm-load --runs 4
//! ubench monitor export <monitor-id> --type range --format csv
//! ubench discover list
//! ubench server instances
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod exit;
mod output;

use commands::client::ClientCommand;
use commands::discover::DiscoverCommand;
use commands::monitor::MonitorCommand;
use commands::server::ServerCommand;
use context::Context;

#[derive(Parser)]
#[command(
    name = "ubench",
    about = "Benchmark orchestration for SLURM clusters",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command.
#[derive(Debug, Default, Args)]
pub struct GlobalArgs {
    /// Configuration file (default: ./ubench.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory holding the instance store and discovery registry.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Recipe directory (with servers/, monitors/ and clients/).
    #[arg(long, global = true)]
    pub recipes: Option<PathBuf>,

    /// Log more (-v: ubench debug, -vv: everything).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inference servers.
    Server {
        #[command(subcommand)]
        action: ServerCommand,
    },
    /// Metric collectors for deployed services.
    Monitor {
        #[command(subcommand)]
        action: MonitorCommand,
    },
    /// Benchmark clients.
    Client {
        #[command(subcommand)]
        action: ClientCommand,
    },
    /// The service discovery registry.
    Discover {
        #[command(subcommand)]
        action: DiscoverCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose, cli.global.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit::exit_code(&e))
        }
    }
}

/// Logs go to stderr; stdout is reserved for command output.
fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "info,ubench=info",
        1 => "info,ubench=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::load(&cli.global)?;
    match cli.command {
        Commands::Server { action } => commands::server::run(&ctx, action).await,
        Commands::Monitor { action } => commands::monitor::run(&ctx, action).await,
        Commands::Client { action } => commands::client::run(&ctx, action).await,
        Commands::Discover { action } => commands::discover::run(&ctx, action).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_subcommands() {
        let cli = Cli::try_parse_from([
            "ubench", "server", "run", "vllm-small", "--count", "2", "--state-dir", "/tmp/s", "-v",
        ])
        .unwrap();
        assert_eq!(cli.global.state_dir, Some(PathBuf::from("/tmp/s")));
        assert_eq!(cli.global.verbose, 1);
        assert!(matches!(
            cli.command,
            Commands::Server {
                action: ServerCommand::Run { count: 2, .. }
            }
        ));
    }

    #[test]
    fn every_group_lists_stored_instances() {
        for group in ["server", "monitor", "client"] {
            let cli = Cli::try_parse_from(["ubench", group, "instances"]).unwrap();
            let listed = match cli.command {
                Commands::Server { action } => matches!(action, ServerCommand::Instances),
                Commands::Monitor { action } => matches!(action, MonitorCommand::Instances),
                Commands::Client { action } => matches!(action, ClientCommand::Instances),
                Commands::Discover { .. } => false,
            };
            assert!(listed, "{group} instances");
        }
    }

    #[test]
    fn start_is_an_alias_of_run() {
        let cli = Cli::try_parse_from(["ubench", "server", "start", "vllm-small"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Server {
                action: ServerCommand::Run { .. }
            }
        ));
    }
}
