//! `ubench discover ...`: inspect and repair the service registry.

use clap::Subcommand;

use ubench_scheduler::OrchestratorError;

use crate::context::Context;
use crate::output;

#[derive(Debug, Subcommand)]
pub enum DiscoverCommand {
    /// List registered services.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show where one service runs.
    Show {
        service: String,
        #[arg(long)]
        json: bool,
    },
    /// Remove every registration.
    Clear,
    /// Remove one registration.
    Remove { service: String },
    /// Point a service at the host a job runs on.
    ///
    /// Without a job id the service's current job is looked up again.
    Update {
        service: String,
        job: Option<String>,
        /// Comma-separated ports (default: the tracked instance's, else the
        /// current registration's).
        #[arg(long, value_delimiter = ',')]
        ports: Vec<u16>,
    },
}

pub async fn run(ctx: &Context, command: DiscoverCommand) -> anyhow::Result<()> {
    match command {
        DiscoverCommand::List { json } => {
            let entries = ctx.registry()?.list()?;
            if json {
                output::print_json(&entries)?;
            } else {
                output::print_entries(&entries);
            }
        }
        DiscoverCommand::Show { service, json } => {
            let entry = ctx
                .registry()?
                .lookup(&service)?
                .ok_or(OrchestratorError::DiscoveryMiss { service })?;
            if json {
                output::print_json(&entry)?;
            } else {
                output::print_entries(std::slice::from_ref(&entry));
            }
        }
        DiscoverCommand::Clear => {
            let removed = ctx.registry()?.clear()?;
            println!("Removed {removed} registration(s).");
        }
        DiscoverCommand::Remove { service } => {
            if ctx.registry()?.remove(&service)? {
                println!("Removed '{service}'.");
            } else {
                return Err(OrchestratorError::DiscoveryMiss { service }.into());
            }
        }
        DiscoverCommand::Update {
            service,
            job,
            ports,
        } => {
            let orch = ctx.orchestrator()?;
            let handle = match job {
                Some(job) => job,
                None => {
                    orch.registry()
                        .lookup(&service)?
                        .ok_or_else(|| OrchestratorError::DiscoveryMiss {
                            service: service.clone(),
                        })?
                        .handle
                }
            };
            let ports = (!ports.is_empty()).then_some(ports);
            let entry = orch.update_discovery(&service, &handle, ports).await?;
            output::print_entries(std::slice::from_ref(&entry));
        }
    }
    Ok(())
}
