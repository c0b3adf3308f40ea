//! MonitorLifecycle: collectors on top of the deployment orchestrator.
//!
//! A monitor is a collector instance: its targets are resolved once at
//! start (and again on refresh), its configuration lives under the state
//! directory, and once RUNNING its query base URL is recorded in the
//! instance metadata so later exports can find it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use ubench_core::config::{ContainerSettings, UbenchConfig};
use ubench_core::RecipeCatalog;
use ubench_scheduler::DeploymentOrchestrator;
use ubench_state::{
    Instance, InstanceKind, InstanceStatus, META_COLLECTOR_PORT, META_COLLECTOR_URL,
    META_SERVICE_KIND, META_TARGETS,
};

use crate::catalog::{MetricQuery, ServiceKind};
use crate::collector::{CollectorClient, CollectorLayout, collector_unit, render_config};
use crate::error::{MonitorError, MonitorResult};
use crate::export::{self, ExportRequest};
use crate::targets::{Target, TargetResolver};

/// Where monitors keep their files.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub state_dir: PathBuf,
    /// Default directory for metric exports.
    pub export_dir: PathBuf,
    pub containers: ContainerSettings,
}

impl MonitorSettings {
    pub fn from_config(config: &UbenchConfig) -> Self {
        Self {
            state_dir: config.paths.state.clone(),
            export_dir: config.paths.output.join("metrics"),
            containers: config.containers.clone(),
        }
    }

    fn monitor_dir(&self, id: &str) -> MonitorResult<PathBuf> {
        // Batch jobs may start in another working directory.
        Ok(std::path::absolute(self.state_dir.join("monitors").join(id))?)
    }

    fn image_cache(&self) -> MonitorResult<PathBuf> {
        let cache = &self.containers.image_cache;
        let cache = if cache.is_absolute() {
            cache.clone()
        } else {
            self.state_dir.join(cache)
        };
        Ok(std::path::absolute(cache)?)
    }
}

pub struct MonitorLifecycle {
    orchestrator: DeploymentOrchestrator,
    catalog: RecipeCatalog,
    collector: Arc<dyn CollectorClient>,
    settings: MonitorSettings,
}

impl MonitorLifecycle {
    pub fn new(
        orchestrator: DeploymentOrchestrator,
        catalog: RecipeCatalog,
        collector: Arc<dyn CollectorClient>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            collector,
            settings,
        }
    }

    pub fn orchestrator(&self) -> &DeploymentOrchestrator {
        &self.orchestrator
    }

    fn target_resolver(&self) -> TargetResolver<'_> {
        TargetResolver::new(self.orchestrator.resolver(), self.orchestrator.registry())
    }

    /// Resolve targets, write the collector config and deploy the collector.
    ///
    /// `job_ids[i]` pins the i-th target to a scheduler job.
    pub async fn start(&self, recipe_name: &str, job_ids: &[String]) -> MonitorResult<Instance> {
        let recipe = self.catalog.load_monitor(recipe_name)?;
        let targets = self.target_resolver().resolve(&recipe, job_ids).await?;

        let id = Uuid::new_v4().to_string();
        let layout = CollectorLayout::new(&self.settings.monitor_dir(&id)?);
        let config_path = layout.write_config(&render_config(&recipe.collector, &targets)?)?;
        info!(instance_id = %id, monitor = %recipe.name, config = %config_path.display(), targets = targets.len(), "starting collector");

        let unit = collector_unit(
            &recipe,
            &targets,
            &layout,
            &self.settings.containers,
            &self.settings.image_cache()?,
        )?;
        let instance = self.orchestrator.deploy_instance(&unit, &id).await?;
        self.record_collector_url(instance)
    }

    /// Refreshed state of one monitor.
    pub async fn status(&self, id: &str) -> MonitorResult<Instance> {
        let instance = self.collector_instance(id)?;
        let instance = self.orchestrator.status(&instance.id).await?;
        self.record_collector_url(instance)
    }

    /// Refreshed state of every monitor.
    pub async fn list(&self) -> MonitorResult<Vec<Instance>> {
        self.orchestrator
            .collect_status(Some(InstanceKind::Collector))
            .await?
            .into_iter()
            .map(|i| self.record_collector_url(i))
            .collect()
    }

    /// Re-resolve targets, rewrite the config and, if the collector is
    /// running, tell it to reload.
    pub async fn refresh_targets(&self, id: &str, job_ids: &[String]) -> MonitorResult<Vec<Target>> {
        let instance = self.status(id).await?;
        if instance.is_terminal() {
            return Err(MonitorError::NotRunning {
                id: instance.id,
                status: instance.status.to_string(),
            });
        }
        let recipe = self.catalog.load_monitor(&instance.recipe_name)?;
        let targets = self.target_resolver().resolve(&recipe, job_ids).await?;

        let layout = CollectorLayout::new(&self.settings.monitor_dir(&instance.id)?);
        layout.write_config(&render_config(&recipe.collector, &targets)?)?;
        let targets_json = serde_json::to_value(&targets)?;
        let updated = self
            .orchestrator
            .store()
            .update(&instance.id, |i| i.set_metadata(META_TARGETS, targets_json))?
            .ok_or_else(|| MonitorError::NoSuchInstance(instance.id.clone()))?;

        match updated.collector_url() {
            Some(url) => {
                self.collector.reload(url).await?;
                info!(instance_id = %updated.id, %url, targets = targets.len(), "collector reloaded");
            }
            None => info!(instance_id = %updated.id, "collector not running yet, new config applies at start"),
        }
        Ok(targets)
    }

    /// Export one RUNNING monitor's metrics. Returns the written file.
    pub async fn export_metrics(&self, id: &str, request: &ExportRequest) -> MonitorResult<PathBuf> {
        let instance = self.status(id).await?;
        let url = match (instance.status, instance.collector_url()) {
            (InstanceStatus::Running, Some(url)) => url.to_string(),
            _ => {
                return Err(MonitorError::NotRunning {
                    id: instance.id,
                    status: instance.status.to_string(),
                });
            }
        };
        let queries = self.queries_for(&instance, request);
        let path = match &request.output {
            Some(path) => path.clone(),
            None => self.default_export_path(&self.settings.export_dir, &instance, request),
        };
        export::export_to(self.collector.as_ref(), &url, &queries, request, &path).await
    }

    /// Export every RUNNING monitor into `dir` (default: the export dir).
    ///
    /// One monitor failing does not stop the others.
    pub async fn export_all_running(
        &self,
        request: &ExportRequest,
        dir: Option<&Path>,
    ) -> MonitorResult<Vec<(String, MonitorResult<PathBuf>)>> {
        let dir = dir.unwrap_or(&self.settings.export_dir);
        let running: Vec<Instance> = self
            .list()
            .await?
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .collect();
        if running.is_empty() {
            info!("no running monitors to export");
        }

        let mut results = Vec::with_capacity(running.len());
        for instance in running {
            let per_monitor = ExportRequest {
                output: Some(self.default_export_path(dir, &instance, request)),
                ..request.clone()
            };
            let result = self.export_metrics(&instance.id, &per_monitor).await;
            if let Err(e) = &result {
                warn!(instance_id = %instance.id, error = %e, "export failed");
            }
            results.push((instance.id, result));
        }
        Ok(results)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn collector_instance(&self, id: &str) -> MonitorResult<Instance> {
        match self.orchestrator.find(id)? {
            Some(instance) if instance.kind == InstanceKind::Collector => Ok(instance),
            _ => Err(MonitorError::NoSuchInstance(id.to_string())),
        }
    }

    /// Record `http://{host}:{port}` the first time a collector is seen
    /// RUNNING.
    fn record_collector_url(&self, instance: Instance) -> MonitorResult<Instance> {
        if instance.status != InstanceStatus::Running || instance.collector_url().is_some() {
            return Ok(instance);
        }
        let Some(host) = instance.host.clone() else {
            return Ok(instance);
        };
        let port = instance
            .metadata
            .get(META_COLLECTOR_PORT)
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .or_else(|| instance.ports.first().copied())
            .unwrap_or(9090);
        let url = format!("http://{host}:{port}");
        let updated = self
            .orchestrator
            .store()
            .update(&instance.id, |i| i.set_metadata(META_COLLECTOR_URL, url.as_str()))?;
        info!(instance_id = %instance.id, %url, "collector reachable");
        Ok(updated.unwrap_or(instance))
    }

    fn queries_for(&self, instance: &Instance, request: &ExportRequest) -> Vec<MetricQuery> {
        if let Some(custom) = &request.queries {
            return custom.clone();
        }
        let kind = instance
            .metadata_str(META_SERVICE_KIND)
            .unwrap_or(&instance.service_name);
        ServiceKind::from_name(kind).queries()
    }

    fn default_export_path(&self, dir: &Path, instance: &Instance, request: &ExportRequest) -> PathBuf {
        let short: String = instance.id.chars().take(8).collect();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        dir.join(format!(
            "metrics_{}_{short}_{stamp}.{}",
            instance.recipe_name,
            request.format.extension()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ubench_core::config::SlurmSettings;
    use ubench_scheduler::fake::FakeScheduler;
    use ubench_scheduler::{JobStatus, OrchestratorSettings, WaitOptions};
    use ubench_state::{DiscoveryRegistry, InstanceStore};

    use crate::export::tests::{FakeCollector, healthy_collector};
    use crate::export::{ExportFormat, ExportKind};

    const MONITOR_TOML: &str = r#"
kind = "monitor"
name = "vllm-monitor"
service_name = "vllm"

[collector]
port = 9091
scrape_interval = "5s"
"#;

    struct Harness {
        fake: Arc<FakeScheduler>,
        collector: Arc<FakeCollector>,
        lifecycle: MonitorLifecycle,
        dir: tempfile::TempDir,
    }

    fn harness_with(fake: FakeScheduler, collector: FakeCollector) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let recipes = dir.path().join("recipes");
        std::fs::create_dir_all(recipes.join("monitors")).unwrap();
        std::fs::write(recipes.join("monitors/vllm-monitor.toml"), MONITOR_TOML).unwrap();

        let fake = Arc::new(fake);
        let collector = Arc::new(collector);
        let registry = DiscoveryRegistry::open_in_memory().unwrap();
        registry.register("vllm", "mel2013", &[8000], "900").unwrap();
        let orchestrator = DeploymentOrchestrator::new(
            fake.clone(),
            InstanceStore::open_in_memory().unwrap(),
            registry,
            OrchestratorSettings {
                slurm: SlurmSettings::default(),
                log_dir: dir.path().join("logs"),
                wait: WaitOptions {
                    timeout: Duration::from_millis(200),
                    poll_interval: Duration::from_millis(5),
                },
            },
        );
        let lifecycle = MonitorLifecycle::new(
            orchestrator,
            RecipeCatalog::new(recipes),
            collector.clone(),
            MonitorSettings {
                state_dir: dir.path().join("state"),
                export_dir: dir.path().join("exports"),
                containers: ContainerSettings::default(),
            },
        );
        Harness {
            fake,
            collector,
            lifecycle,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(
            FakeScheduler::with_default_sequence(vec![JobStatus::running("mel2100")]),
            healthy_collector(),
        )
    }

    #[tokio::test]
    async fn start_writes_config_and_records_url() {
        let h = harness();
        let instance = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();

        assert_eq!(instance.kind, InstanceKind::Collector);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.collector_url(), Some("http://mel2100:9091"));
        assert_eq!(instance.metadata[META_TARGETS][0]["address"], "mel2013:8000");

        let config = h
            .dir
            .path()
            .join("state/monitors")
            .join(&instance.id)
            .join("config/prometheus.yml");
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(config).unwrap()).unwrap();
        assert_eq!(v["global"]["scrape_interval"], "5s");
        assert_eq!(v["scrape_configs"][0]["static_configs"][0]["targets"][0], "mel2013:8000");

        let (_, script) = h.fake.submitted().pop().unwrap();
        assert!(script.contains("--web.listen-address=0.0.0.0:9091"));
        // Collectors never take over the monitored service's name.
        assert_eq!(
            h.lifecycle.orchestrator().registry().lookup("vllm").unwrap().unwrap().host,
            "mel2013"
        );
    }

    #[tokio::test]
    async fn start_without_targets_submits_nothing() {
        let h = harness();
        h.lifecycle.orchestrator().registry().clear().unwrap();
        let err = h.lifecycle.start("vllm-monitor", &[]).await.unwrap_err();
        assert!(matches!(err, MonitorError::NoTargetsResolved { .. }));
        assert!(h.fake.submitted().is_empty());
    }

    #[tokio::test]
    async fn late_placement_records_url_on_status() {
        let h = harness_with(
            FakeScheduler::with_default_sequence(vec![JobStatus::pending()]),
            healthy_collector(),
        );
        let err = h.lifecycle.start("vllm-monitor", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Orchestrator(ubench_scheduler::OrchestratorError::PlacementTimeout { .. })
        ));

        let pending = h.lifecycle.list().await.unwrap().pop().unwrap();
        assert_eq!(pending.status, InstanceStatus::Pending);
        assert!(pending.collector_url().is_none());

        h.fake.script(&pending.handle, vec![JobStatus::running("mel2200")]);
        let running = h.lifecycle.status(&pending.id).await.unwrap();
        assert_eq!(running.collector_url(), Some("http://mel2200:9091"));
    }

    #[tokio::test]
    async fn refresh_rewrites_config_and_reloads() {
        let h = harness();
        let instance = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        h.fake.script("777", vec![JobStatus::running("mel2300")]);

        let targets = h
            .lifecycle
            .refresh_targets(&instance.id, &["777".to_string()])
            .await
            .unwrap();
        assert_eq!(targets[0].address, "mel2300:8000");
        assert_eq!(*h.collector.reloads.lock().unwrap(), vec!["http://mel2100:9091".to_string()]);

        let stored = h.lifecycle.status(&instance.id).await.unwrap();
        assert_eq!(stored.metadata[META_TARGETS][0]["address"], "mel2300:8000");
    }

    #[tokio::test]
    async fn export_writes_into_export_dir() {
        let h = harness();
        let instance = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        let path = h
            .lifecycle
            .export_metrics(&instance.id, &ExportRequest::default())
            .await
            .unwrap();
        assert!(path.starts_with(h.dir.path().join("exports")));
        assert_eq!(path.extension().unwrap(), "json");

        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let metrics = v["metrics"].as_object().unwrap();
        assert_eq!(metrics.len(), ServiceKind::Vllm.queries().len());
        assert!(metrics.values().all(|m| !m["result_type"].is_null()));
    }

    #[tokio::test]
    async fn custom_queries_replace_the_table() {
        let h = harness();
        let instance = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        let output = h.dir.path().join("custom.csv");
        let request = ExportRequest {
            kind: ExportKind::Instant,
            format: ExportFormat::Csv,
            output: Some(output.clone()),
            queries: Some(MetricQuery::parse_list("vllm_num_requests_running:Running")),
            ..ExportRequest::default()
        };
        h.lifecycle.export_metrics(&instance.id, &request).await.unwrap();
        let csv = std::fs::read_to_string(output).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.lines().nth(1).unwrap().starts_with("vllm_num_requests_running,Running,"));
    }

    #[tokio::test]
    async fn export_requires_running_monitor() {
        let h = harness();
        let instance = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        h.lifecycle.orchestrator().stop(&instance.id).await.unwrap();
        let err = h
            .lifecycle
            .export_metrics(&instance.id, &ExportRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NotRunning { .. }));

        let err = h
            .lifecycle
            .export_metrics("missing-id", &ExportRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NoSuchInstance(_)));
    }

    #[tokio::test]
    async fn export_all_skips_stopped_monitors() {
        let h = harness();
        let a = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        let b = h.lifecycle.start("vllm-monitor", &[]).await.unwrap();
        h.lifecycle.orchestrator().stop(&b.id).await.unwrap();

        let out = h.dir.path().join("periodic");
        let results = h
            .lifecycle
            .export_all_running(&ExportRequest::default(), Some(&out))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, a.id);
        assert!(results[0].1.as_ref().unwrap().starts_with(&out));
    }
}
