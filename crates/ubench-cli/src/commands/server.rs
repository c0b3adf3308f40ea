//! `ubench server ...`

use clap::Subcommand;
use tracing::info;

use ubench_core::RecipeKind;
use ubench_scheduler::DeploymentUnit;
use ubench_state::InstanceKind;

use super::common;
use crate::context::Context;

#[derive(Debug, Subcommand)]
pub enum ServerCommand {
    /// Submit a server recipe and wait until it is placed and discoverable.
    #[command(visible_alias = "start")]
    Run {
        recipe: String,
        /// Number of replicas.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Return right after submission instead of waiting for placement.
        #[arg(long)]
        no_wait: bool,
    },
    /// List available server recipes.
    List,
    /// Show server instances, refreshed from the scheduler.
    Status {
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show stored server instances without asking the scheduler.
    Instances,
    /// Cancel one server instance.
    Stop { id: String },
    /// Cancel every active server instance.
    StopAll,
    /// Show a server recipe.
    Info { recipe: String },
    /// Write a starter server recipe.
    Template { name: String },
    /// Forget stopped and failed server instances.
    Prune,
}

pub async fn run(ctx: &Context, command: ServerCommand) -> anyhow::Result<()> {
    const KIND: InstanceKind = InstanceKind::Server;
    match command {
        ServerCommand::Run {
            recipe,
            count,
            no_wait,
        } => {
            let server = ctx.catalog.load_server(&recipe)?;
            let unit = DeploymentUnit::for_server(&server, &ctx.config.containers);
            let orch = ctx.orchestrator()?;
            info!(recipe = %recipe, service = %server.service_name(), count, "deploying server");
            let report = if no_wait {
                orch.submit(&unit, count).await?
            } else {
                orch.deploy(&unit, count).await?
            };
            common::finish_deploy(report, &recipe)
        }
        ServerCommand::List => common::list_recipes(ctx, RecipeKind::Server),
        ServerCommand::Status { id, json } => common::status(ctx, KIND, id.as_deref(), json).await,
        ServerCommand::Instances => common::list(ctx, KIND),
        ServerCommand::Stop { id } => common::stop(ctx, KIND, &id).await,
        ServerCommand::StopAll => common::stop_all(ctx, KIND).await,
        ServerCommand::Info { recipe } => common::recipe_info(ctx, RecipeKind::Server, &recipe),
        ServerCommand::Template { name } => common::template(ctx, RecipeKind::Server, &name),
        ServerCommand::Prune => common::prune(ctx, KIND),
    }
}
