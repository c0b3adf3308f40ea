//! Subcommands every instance group shares: recipe catalog access plus
//! list, status, stop, stop-all and prune over one instance kind.

use anyhow::{Context as _, bail};
use tracing::{info, warn};

use ubench_core::RecipeKind;
use ubench_scheduler::{DeployReport, DeploymentOrchestrator, OrchestratorError, StopOutcome};
use ubench_state::{Instance, InstanceKind};

use crate::context::Context;
use crate::output;

// ── Recipes ────────────────────────────────────────────────────────

pub fn list_recipes(ctx: &Context, kind: RecipeKind) -> anyhow::Result<()> {
    let recipes = ctx.catalog.list(kind)?;
    output::print_recipes(&recipes);
    Ok(())
}

pub fn recipe_info(ctx: &Context, kind: RecipeKind, name: &str) -> anyhow::Result<()> {
    let recipe = ctx.catalog.load(kind, name)?;
    println!("Name:        {}", recipe.name());
    println!("Kind:        {}", recipe.kind());
    println!("Service:     {}", recipe.service_name());
    if !recipe.description().is_empty() {
        println!("Description: {}", recipe.description());
    }
    println!("File:        {}", ctx.catalog.path_for(kind, name).display());
    println!();
    print!("{}", recipe.to_toml_string()?);
    Ok(())
}

pub fn template(ctx: &Context, kind: RecipeKind, name: &str) -> anyhow::Result<()> {
    let path = ctx.catalog.write_template(kind, name)?;
    println!("Created {kind} recipe template {}", path.display());
    Ok(())
}

// ── Instances ──────────────────────────────────────────────────────

/// Stored records, without asking the scheduler.
pub fn list(ctx: &Context, kind: InstanceKind) -> anyhow::Result<()> {
    let instances = ctx.store()?.list_kind(kind)?;
    output::print_instances(&instances);
    Ok(())
}

/// Refreshed status of one instance, or of every instance of `kind`.
pub async fn status(
    ctx: &Context,
    kind: InstanceKind,
    id: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let orch = ctx.orchestrator()?;
    match id {
        Some(id) => {
            let instance = of_kind(&orch, kind, id)?;
            let instance = orch.status(&instance.id).await?;
            if json {
                output::print_json(&instance)?;
            } else {
                output::print_instance(&instance);
            }
        }
        None => {
            let instances = orch.collect_status(Some(kind)).await?;
            if json {
                output::print_json(&instances)?;
            } else {
                output::print_instances(&instances);
            }
        }
    }
    Ok(())
}

/// Unknown ids, and ids of another kind, are reported and left alone.
pub async fn stop(ctx: &Context, kind: InstanceKind, id: &str) -> anyhow::Result<()> {
    let orch = ctx.orchestrator()?;
    let (id, outcome) = stop_of_kind(&orch, kind, id).await?;
    report_stop(&id, &outcome);
    Ok(())
}

async fn stop_of_kind(
    orch: &DeploymentOrchestrator,
    kind: InstanceKind,
    id: &str,
) -> anyhow::Result<(String, StopOutcome)> {
    let Some(instance) = find_of_kind(orch, kind, id)? else {
        info!(instance_id = %id, %kind, "nothing to stop");
        return Ok((id.to_string(), StopOutcome::NotFound));
    };
    let outcome = orch
        .stop(&instance.id)
        .await
        .with_context(|| format!("stopping {kind} {}", output::short_id(&instance.id)))?;
    Ok((instance.id, outcome))
}

/// Stops everything it can; fails afterwards if any stop failed.
pub async fn stop_all(ctx: &Context, kind: InstanceKind) -> anyhow::Result<()> {
    let results = ctx.orchestrator()?.stop_all(Some(kind)).await?;
    if results.is_empty() {
        println!("No active {kind} instances.");
        return Ok(());
    }
    let mut failed = 0usize;
    for (id, result) in &results {
        match result {
            Ok(outcome) => report_stop(id, outcome),
            Err(e) => {
                failed += 1;
                println!("{}  failed: {e}", output::short_id(id));
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} {kind} instances could not be stopped", results.len());
    }
    Ok(())
}

pub fn prune(ctx: &Context, kind: InstanceKind) -> anyhow::Result<()> {
    let removed = ctx.orchestrator()?.prune(Some(kind))?;
    println!("Removed {} finished {kind} instance(s).", removed.len());
    Ok(())
}

/// Resolve `id` (or a unique prefix) to an instance of `kind`.
pub fn of_kind(
    orch: &DeploymentOrchestrator,
    kind: InstanceKind,
    id: &str,
) -> anyhow::Result<Instance> {
    find_of_kind(orch, kind, id)?
        .ok_or_else(|| OrchestratorError::NoSuchInstance(id.to_string()).into())
}

fn find_of_kind(
    orch: &DeploymentOrchestrator,
    kind: InstanceKind,
    id: &str,
) -> anyhow::Result<Option<Instance>> {
    match orch.find(id)? {
        Some(instance) if instance.kind == kind => Ok(Some(instance)),
        Some(instance) => {
            warn!(instance_id = %instance.id, found = %instance.kind, expected = %kind, "instance is of another kind");
            Ok(None)
        }
        None => Ok(None),
    }
}

fn report_stop(id: &str, outcome: &StopOutcome) {
    let short = output::short_id(id);
    match outcome {
        StopOutcome::Stopped(_) => println!("{short}  stopped"),
        StopOutcome::AlreadyTerminal(i) => println!("{short}  already {}", i.status),
        StopOutcome::NotFound => println!("{short}  not found, nothing to stop"),
    }
}

/// Print what a deploy or submit produced. The first replica failure, if
/// any, becomes the command's error.
pub fn finish_deploy(report: DeployReport, recipe: &str) -> anyhow::Result<()> {
    output::print_instances(&report.instances);
    let total = report.submitted() + report.failures.len();
    let failed = report.failures.len();
    match report.failures.into_iter().next() {
        None => Ok(()),
        Some(first) => Err(anyhow::Error::new(first.error).context(format!(
            "{failed} of {total} replica(s) of '{recipe}' failed (first: replica {})",
            first.replica
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use ubench_core::config::SlurmSettings;
    use ubench_scheduler::fake::FakeScheduler;
    use ubench_scheduler::{DeploymentUnit, OrchestratorSettings, WaitOptions};
    use ubench_state::{DiscoveryRegistry, InstanceStatus, InstanceStore};

    fn orchestrator(logs: &Path) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(
            Arc::new(FakeScheduler::new()),
            InstanceStore::open_in_memory().unwrap(),
            DiscoveryRegistry::open_in_memory().unwrap(),
            OrchestratorSettings {
                slurm: SlurmSettings::default(),
                log_dir: logs.to_path_buf(),
                wait: WaitOptions {
                    timeout: Duration::from_millis(200),
                    poll_interval: Duration::from_millis(5),
                },
            },
        )
    }

    #[tokio::test]
    async fn stopping_an_unknown_id_is_a_reported_no_op() {
        let logs = tempfile::tempdir().unwrap();
        let orch = orchestrator(logs.path());
        let (id, outcome) = stop_of_kind(&orch, InstanceKind::Server, "feedface").await.unwrap();
        assert_eq!(id, "feedface");
        assert_eq!(outcome, StopOutcome::NotFound);
    }

    #[tokio::test]
    async fn stop_leaves_other_kinds_alone() {
        let logs = tempfile::tempdir().unwrap();
        let orch = orchestrator(logs.path());
        let unit = DeploymentUnit::new(InstanceKind::Collector, "vllm-monitor", "vllm", "prometheus");
        orch.deploy_instance(&unit, "mon-00001").await.unwrap();

        let (_, outcome) = stop_of_kind(&orch, InstanceKind::Server, "mon-00001").await.unwrap();
        assert_eq!(outcome, StopOutcome::NotFound);
        assert_eq!(
            orch.store().get("mon-00001").unwrap().unwrap().status,
            InstanceStatus::Running
        );

        let (id, outcome) = stop_of_kind(&orch, InstanceKind::Collector, "mon-0").await.unwrap();
        assert_eq!(id, "mon-00001");
        assert!(matches!(outcome, StopOutcome::Stopped(ref i) if i.status == InstanceStatus::Stopped));
        assert!(of_kind(&orch, InstanceKind::Server, "mon-00001").is_err());
    }
}
