//! Everything a command needs, built from config, environment and flags.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use ubench_core::{RecipeCatalog, UbenchConfig};
use ubench_monitor::{MonitorLifecycle, MonitorSettings, PrometheusClient};
use ubench_scheduler::{DeploymentOrchestrator, OrchestratorSettings, SlurmScheduler, WaitOptions};
use ubench_state::{DiscoveryRegistry, InstanceStore};

use crate::GlobalArgs;

pub struct Context {
    pub config: UbenchConfig,
    pub catalog: RecipeCatalog,
    interrupted: watch::Receiver<bool>,
}

impl Context {
    /// Defaults, then `ubench.toml`, then environment, then flags.
    pub fn load(args: &GlobalArgs) -> anyhow::Result<Self> {
        let mut config = UbenchConfig::load(args.config.as_deref())?;
        if let Some(dir) = &args.state_dir {
            config.paths.state = dir.clone();
        }
        if let Some(dir) = &args.recipes {
            config.paths.recipes = dir.clone();
        }
        debug!(
            state = %config.paths.state.display(),
            recipes = %config.paths.recipes.display(),
            "configuration resolved"
        );
        let catalog = RecipeCatalog::new(config.paths.recipes.clone());
        Ok(Self {
            config,
            catalog,
            interrupted: interrupt_channel(),
        })
    }

    /// Flips to true on the first Ctrl-C.
    pub fn interrupted(&self) -> watch::Receiver<bool> {
        self.interrupted.clone()
    }

    pub fn store(&self) -> anyhow::Result<InstanceStore> {
        Ok(InstanceStore::open(&self.config.instances_db())?)
    }

    pub fn registry(&self) -> anyhow::Result<DiscoveryRegistry> {
        Ok(DiscoveryRegistry::open(&self.config.discovery_db())?)
    }

    pub fn orchestrator(&self) -> anyhow::Result<DeploymentOrchestrator> {
        let settings = OrchestratorSettings {
            slurm: self.config.slurm.clone(),
            log_dir: std::path::absolute(self.config.paths.output.join("slurm"))?,
            wait: WaitOptions {
                timeout: self.config.placement_timeout()?,
                poll_interval: self.config.poll_interval()?,
            },
        };
        Ok(DeploymentOrchestrator::new(
            Arc::new(SlurmScheduler::new().with_command_timeout(self.config.command_timeout()?)),
            self.store()?,
            self.registry()?,
            settings,
        )
        .with_cancel(self.interrupted()))
    }

    pub fn lifecycle(&self) -> anyhow::Result<MonitorLifecycle> {
        Ok(MonitorLifecycle::new(
            self.orchestrator()?,
            self.catalog.clone(),
            Arc::new(PrometheusClient::default()),
            MonitorSettings::from_config(&self.config),
        ))
    }
}

/// First Ctrl-C cancels placement waits and periodic exports; a second
/// one exits immediately.
fn interrupt_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handling: never fire, but keep the sender alive.
            std::future::pending::<()>().await;
        }
        warn!("interrupted; press Ctrl-C again to exit immediately");
        let _ = tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    rx
}
