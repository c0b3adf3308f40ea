//! `ubench client ...`

use clap::Subcommand;
use tracing::info;

use ubench_core::RecipeKind;
use ubench_scheduler::DeploymentUnit;
use ubench_scheduler::client::client_target_url;
use ubench_state::InstanceKind;

use super::common;
use crate::context::Context;

#[derive(Debug, Subcommand)]
pub enum ClientCommand {
    /// Submit a benchmark client against its server.
    #[command(visible_alias = "start")]
    Run {
        recipe: String,
        /// Number of independent runs to submit.
        #[arg(long, default_value_t = 1)]
        runs: usize,
        /// Wait until every run is placed.
        #[arg(long)]
        wait: bool,
    },
    /// List available client recipes.
    List,
    /// Show client runs, refreshed from the scheduler.
    Status {
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show stored client runs without asking the scheduler.
    Instances,
    /// Cancel one client run.
    Stop { id: String },
    /// Cancel every active client run.
    StopAll,
    /// Show a client recipe.
    Info { recipe: String },
    /// Write a starter client recipe.
    Template { name: String },
    /// Forget finished client runs.
    Prune,
}

pub async fn run(ctx: &Context, command: ClientCommand) -> anyhow::Result<()> {
    const KIND: InstanceKind = InstanceKind::Client;
    match command {
        ClientCommand::Run { recipe, runs, wait } => {
            let client = ctx.catalog.load_client(&recipe)?;
            let orch = ctx.orchestrator()?;
            let target = client_target_url(&client, orch.registry())?;
            info!(recipe = %recipe, target = %target, runs, "submitting benchmark client");
            let unit = DeploymentUnit::for_client(&client, &target)?;
            let report = if wait {
                orch.deploy(&unit, runs).await?
            } else {
                orch.submit(&unit, runs).await?
            };
            println!("Target: {target}");
            common::finish_deploy(report, &recipe)
        }
        ClientCommand::List => common::list_recipes(ctx, RecipeKind::Client),
        ClientCommand::Status { id, json } => common::status(ctx, KIND, id.as_deref(), json).await,
        ClientCommand::Instances => common::list(ctx, KIND),
        ClientCommand::Stop { id } => common::stop(ctx, KIND, &id).await,
        ClientCommand::StopAll => common::stop_all(ctx, KIND).await,
        ClientCommand::Info { recipe } => common::recipe_info(ctx, RecipeKind::Client, &recipe),
        ClientCommand::Template { name } => common::template(ctx, RecipeKind::Client, &name),
        ClientCommand::Prune => common::prune(ctx, KIND),
    }
}
