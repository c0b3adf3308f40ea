//! DeploymentOrchestrator: submits units and drives instances to a host.
//!
//! The orchestrator is the only writer of instance records. Every status
//! change goes through [`Instance::advance`] inside a store read-modify-write,
//! so a transition computed from stale information (for instance a placement
//! poll racing an explicit stop from another process) can never move a
//! record backwards.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ubench_core::config::SlurmSettings;
use ubench_state::{
    DiscoveryEntry, DiscoveryRegistry, Instance, InstanceKind, InstanceStatus, InstanceStore,
    META_REASON, META_TERMINAL_STATE,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::resolver::{PlacementResolver, Resolution, WaitOptions, WaitOutcome};
use crate::script::{render_batch_script, DeploymentUnit, ScriptContext};
use crate::slurm::{BatchScheduler, CancelOutcome};

/// Knobs shared by every deployment.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub slurm: SlurmSettings,
    /// Where batch jobs write their stdout/stderr.
    pub log_dir: PathBuf,
    pub wait: WaitOptions,
}

/// Result of a multi-replica deploy.
#[derive(Debug, Default)]
pub struct DeployReport {
    /// Every replica that was submitted, in its latest state.
    pub instances: Vec<Instance>,
    /// Replicas that failed to submit or to place.
    pub failures: Vec<ReplicaFailure>,
}

impl DeployReport {
    pub fn submitted(&self) -> usize {
        self.instances.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &Instance> {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
    }
}

/// Why one replica did not make it.
#[derive(Debug)]
pub struct ReplicaFailure {
    /// Zero-based replica index.
    pub replica: usize,
    pub error: OrchestratorError,
}

/// What `stop` did.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped(Instance),
    /// Already STOPPED or FAILED; nothing was sent to the scheduler.
    AlreadyTerminal(Instance),
    /// No instance with that id.
    NotFound,
}

/// Owns the instance state machine.
pub struct DeploymentOrchestrator {
    scheduler: Arc<dyn BatchScheduler>,
    resolver: PlacementResolver,
    store: InstanceStore,
    registry: DiscoveryRegistry,
    settings: OrchestratorSettings,
    cancel: watch::Receiver<bool>,
}

impl DeploymentOrchestrator {
    pub fn new(
        scheduler: Arc<dyn BatchScheduler>,
        store: InstanceStore,
        registry: DiscoveryRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        let resolver = PlacementResolver::new(scheduler.clone());
        Self {
            scheduler,
            resolver,
            store,
            registry,
            settings,
            cancel: watch::channel(false).1,
        }
    }

    /// Abort placement waits when `cancel` flips to true (e.g. on Ctrl-C).
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &PlacementResolver {
        &self.resolver
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Submit `count` replicas of `unit` and wait until each is placed.
    ///
    /// A failing replica does not roll back the others; the report lists
    /// every submitted instance plus one failure per replica that did not
    /// reach RUNNING.
    pub async fn deploy(
        &self,
        unit: &DeploymentUnit,
        count: usize,
    ) -> OrchestratorResult<DeployReport> {
        let mut report = self.submit(unit, count).await?;
        let submitted = std::mem::take(&mut report.instances);
        let replicas = replica_indices(count, &report.failures);

        for (replica, instance) in replicas.into_iter().zip(submitted) {
            match self.drive(&instance).await {
                Ok(instance) => report.instances.push(instance),
                Err(error) => {
                    if let Some(current) = self.store.get(&instance.id)? {
                        report.instances.push(current);
                    }
                    report.failures.push(ReplicaFailure { replica, error });
                }
            }
        }
        report.failures.sort_by_key(|f| f.replica);
        info!(
            recipe = %unit.recipe_name,
            submitted = report.submitted(),
            running = report.running().count(),
            failed = report.failures.len(),
            "deploy finished"
        );
        Ok(report)
    }

    /// Submit `count` replicas without waiting for placement.
    pub async fn submit(
        &self,
        unit: &DeploymentUnit,
        count: usize,
    ) -> OrchestratorResult<DeployReport> {
        unit.validate()?;
        if count == 0 {
            return Err(OrchestratorError::Validation(
                "replica count must be at least 1".to_string(),
            ));
        }

        let mut report = DeployReport::default();
        for replica in 0..count {
            let id = Uuid::new_v4().to_string();
            match self.submit_one(unit, &id).await {
                Ok(instance) => report.instances.push(instance),
                Err(error @ OrchestratorError::Submission { .. }) => {
                    warn!(recipe = %unit.recipe_name, replica, error = %error, "replica submission failed");
                    report.failures.push(ReplicaFailure { replica, error });
                }
                // Store and I/O failures are not per-replica problems.
                Err(other) => return Err(other),
            }
        }
        Ok(report)
    }

    /// Submit one unit under a caller-chosen id and wait for its placement.
    ///
    /// Used when files must be generated under the id before submission.
    /// Timeouts and placement failures are returned as errors; the record
    /// stays in the store either way.
    pub async fn deploy_instance(
        &self,
        unit: &DeploymentUnit,
        id: &str,
    ) -> OrchestratorResult<Instance> {
        unit.validate()?;
        let instance = self.submit_one(unit, id).await?;
        self.drive(&instance).await
    }

    async fn submit_one(&self, unit: &DeploymentUnit, id: &str) -> OrchestratorResult<Instance> {
        std::fs::create_dir_all(&self.settings.log_dir)?;
        let script = render_batch_script(
            unit,
            &ScriptContext {
                slurm: &self.settings.slurm,
                log_dir: &self.settings.log_dir,
                instance_id: id,
            },
        );
        debug!(instance_id = %id, job = %unit.job_name(), "submitting batch script");

        let handle = self
            .scheduler
            .submit(&script)
            .await
            .map_err(|source| OrchestratorError::Submission {
                recipe: unit.recipe_name.clone(),
                source,
            })?;

        let mut instance = Instance::submitted(
            id,
            &unit.recipe_name,
            &unit.service_name,
            unit.kind,
            &handle,
            unit.ports.clone(),
        );
        instance.metadata.extend(unit.metadata.clone());
        self.store.put(&instance)?;
        info!(instance_id = %id, %handle, kind = %unit.kind, recipe = %unit.recipe_name, "instance submitted");
        Ok(instance)
    }

    /// Poll until placed, then publish. Stops early if the record turns
    /// terminal underneath us.
    async fn drive(&self, instance: &Instance) -> OrchestratorResult<Instance> {
        let id = instance.id.as_str();
        let handle = instance.handle.as_str();
        let store = &self.store;

        let outcome = self
            .resolver
            .wait_for_placement_with(handle, &self.settings.wait, self.cancel.clone(), |resolution| {
                match store.get(id) {
                    Ok(Some(current)) if current.is_terminal() => {
                        info!(instance_id = %id, status = %current.status, "instance ended while waiting for placement");
                        return false;
                    }
                    Ok(None) => return false,
                    Ok(Some(_)) => {}
                    Err(e) => warn!(instance_id = %id, error = %e, "could not re-read instance while polling"),
                }
                if *resolution == Resolution::Pending {
                    if let Err(e) = store.update(id, |i| {
                        i.advance(InstanceStatus::Pending, None);
                    }) {
                        warn!(instance_id = %id, error = %e, "could not record PENDING");
                    }
                }
                true
            })
            .await;

        match outcome {
            WaitOutcome::Resolved(placement) => self.mark_running(id, &placement.host),
            WaitOutcome::Failed(reason) => {
                self.mark_failed(id, &reason)?;
                Err(OrchestratorError::PlacementFailed {
                    handle: handle.to_string(),
                    reason,
                })
            }
            WaitOutcome::Timeout { last_error } => {
                self.store.update(id, |i| {
                    i.advance(InstanceStatus::Pending, None);
                })?;
                warn!(instance_id = %id, %handle, last_error = ?last_error, "placement wait timed out");
                Err(OrchestratorError::PlacementTimeout {
                    instance_id: id.to_string(),
                    handle: handle.to_string(),
                    waited: self.settings.wait.timeout,
                })
            }
            WaitOutcome::Cancelled => match self.store.get(id)? {
                Some(current) if current.is_terminal() => Ok(current),
                Some(_) => Err(OrchestratorError::Interrupted(id.to_string())),
                None => Err(OrchestratorError::NoSuchInstance(id.to_string())),
            },
        }
    }

    /// RUNNING on `host`, and publish servers under their service name.
    fn mark_running(&self, id: &str, host: &str) -> OrchestratorResult<Instance> {
        let mut applied = false;
        let instance = self
            .store
            .update(id, |i| {
                applied = i.advance(InstanceStatus::Running, Some(host.to_string()));
            })?
            .ok_or_else(|| OrchestratorError::NoSuchInstance(id.to_string()))?;

        if applied {
            info!(instance_id = %id, %host, "instance running");
            if instance.kind == InstanceKind::Server {
                if let Err(e) = self.registry.register(
                    &instance.service_name,
                    host,
                    &instance.ports,
                    &instance.handle,
                ) {
                    warn!(instance_id = %id, error = %e, "could not publish service, the next status refresh retries");
                    return Err(e.into());
                }
            }
        } else {
            debug!(instance_id = %id, status = %instance.status, "running transition not applied");
        }
        Ok(instance)
    }

    fn mark_failed(&self, id: &str, reason: &str) -> OrchestratorResult<Option<Instance>> {
        let updated = self.store.update(id, |i| {
            if i.advance(InstanceStatus::Failed, None) {
                i.set_metadata(META_REASON, reason);
                if let Some((_, state)) = reason.rsplit_once("in state ") {
                    i.set_metadata(META_TERMINAL_STATE, state);
                }
            }
        })?;
        warn!(instance_id = %id, %reason, "instance failed");
        Ok(updated)
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Cancel an instance's job and mark it STOPPED.
    ///
    /// Idempotent: unknown ids report `NotFound`, terminal instances report
    /// `AlreadyTerminal`, and a job the scheduler no longer knows counts as
    /// already gone.
    pub async fn stop(&self, id: &str) -> OrchestratorResult<StopOutcome> {
        let Some(instance) = self.find(id)? else {
            info!(instance_id = %id, "stop: no such instance");
            return Ok(StopOutcome::NotFound);
        };
        if instance.is_terminal() {
            return Ok(StopOutcome::AlreadyTerminal(instance));
        }

        match self.scheduler.cancel(&instance.handle).await? {
            CancelOutcome::Cancelled => {}
            CancelOutcome::NotFound => {
                info!(instance_id = %instance.id, handle = %instance.handle, "job already gone, marking stopped");
            }
        }

        let updated = self
            .store
            .update(&instance.id, |i| {
                i.advance(InstanceStatus::Stopped, None);
            })?
            .ok_or_else(|| OrchestratorError::NoSuchInstance(instance.id.clone()))?;
        info!(instance_id = %updated.id, status = %updated.status, "instance stopped");
        Ok(StopOutcome::Stopped(updated))
    }

    /// Stop every non-terminal instance, optionally of one kind.
    ///
    /// One failure does not abort the batch; each id gets its own result.
    pub async fn stop_all(
        &self,
        kind: Option<InstanceKind>,
    ) -> OrchestratorResult<Vec<(String, OrchestratorResult<StopOutcome>)>> {
        let targets: Vec<Instance> = self
            .store
            .list()?
            .into_iter()
            .filter(|i| !i.is_terminal() && kind.is_none_or(|k| i.kind == k))
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for instance in targets {
            let result = self.stop(&instance.id).await;
            if let Err(e) = &result {
                warn!(instance_id = %instance.id, error = %e, "stop failed");
            }
            results.push((instance.id, result));
        }
        Ok(results)
    }

    // ── Status ─────────────────────────────────────────────────────

    /// Latest state of one instance, refreshed from the scheduler unless
    /// the record is already terminal.
    pub async fn status(&self, id: &str) -> OrchestratorResult<Instance> {
        let instance = self
            .find(id)?
            .ok_or_else(|| OrchestratorError::NoSuchInstance(id.to_string()))?;
        self.refresh(instance).await
    }

    /// Refresh every instance, optionally of one kind. Terminal records are
    /// returned as stored.
    pub async fn collect_status(
        &self,
        kind: Option<InstanceKind>,
    ) -> OrchestratorResult<Vec<Instance>> {
        let instances: Vec<Instance> = self
            .store
            .list()?
            .into_iter()
            .filter(|i| kind.is_none_or(|k| i.kind == k))
            .collect();
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            out.push(self.refresh(instance).await?);
        }
        Ok(out)
    }

    async fn refresh(&self, instance: Instance) -> OrchestratorResult<Instance> {
        if instance.is_terminal() {
            return Ok(instance);
        }
        let resolution = match self.resolver.resolve(&instance.handle).await {
            Ok(r) => r,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "scheduler unreachable, showing cached status");
                return Ok(instance);
            }
        };
        let refreshed = match resolution {
            Resolution::Pending => self.store.update(&instance.id, |i| {
                i.advance(InstanceStatus::Pending, None);
            })?,
            Resolution::Resolved(placement) => {
                if instance.status == InstanceStatus::Running {
                    if let Err(e) = self.ensure_published(&instance, &placement.host) {
                        warn!(instance_id = %instance.id, error = %e, "could not re-publish service");
                    }
                    Some(instance.clone())
                } else {
                    Some(self.mark_running(&instance.id, &placement.host)?)
                }
            }
            Resolution::Failed(reason) => self.mark_failed(&instance.id, &reason)?,
        };
        Ok(refreshed.unwrap_or(instance))
    }

    /// A RUNNING server must be discoverable. Publishes it again when its
    /// service has no entry, e.g. after a failed registry write.
    fn ensure_published(&self, instance: &Instance, host: &str) -> OrchestratorResult<()> {
        if instance.kind != InstanceKind::Server
            || self.registry.lookup(&instance.service_name)?.is_some()
        {
            return Ok(());
        }
        info!(instance_id = %instance.id, service = %instance.service_name, %host, "discovery entry missing, publishing again");
        self.registry
            .register(&instance.service_name, host, &instance.ports, &instance.handle)?;
        Ok(())
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// Drop terminal instances from the store, optionally of one kind.
    pub fn prune(&self, kind: Option<InstanceKind>) -> OrchestratorResult<Vec<Instance>> {
        let removed = self
            .store
            .remove_where(|i| i.is_terminal() && kind.is_none_or(|k| i.kind == k))?;
        info!(count = removed.len(), "pruned terminal instances");
        Ok(removed)
    }

    /// Look an instance up by id or by a unique id prefix.
    pub fn find(&self, id: &str) -> OrchestratorResult<Option<Instance>> {
        let instances = self.store.list()?;
        if let Some(exact) = instances.iter().find(|i| i.id == id) {
            return Ok(Some(exact.clone()));
        }
        if id.len() < 4 {
            return Ok(None);
        }
        let mut matches = instances.into_iter().filter(|i| i.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(one), None) => Ok(Some(one)),
            (Some(_), Some(_)) => Err(OrchestratorError::AmbiguousInstance(id.to_string())),
            _ => Ok(None),
        }
    }

    /// Point `service` at the host job `handle` is running on.
    ///
    /// For placements made outside ubench. Ports come from `ports`, else a
    /// tracked instance with that handle, else the existing entry.
    pub async fn update_discovery(
        &self,
        service: &str,
        handle: &str,
        ports: Option<Vec<u16>>,
    ) -> OrchestratorResult<DiscoveryEntry> {
        let placement = match self.resolver.resolve(handle).await? {
            Resolution::Resolved(placement) => placement,
            Resolution::Pending => {
                return Err(OrchestratorError::NotYetPlaced {
                    handle: handle.to_string(),
                });
            }
            Resolution::Failed(reason) => {
                return Err(OrchestratorError::PlacementFailed {
                    handle: handle.to_string(),
                    reason,
                });
            }
        };

        let ports = match ports {
            Some(ports) => ports,
            None => {
                let tracked = self
                    .store
                    .list()?
                    .into_iter()
                    .find(|i| i.handle == handle)
                    .map(|i| i.ports);
                match tracked {
                    Some(ports) => ports,
                    None => self
                        .registry
                        .lookup(service)?
                        .map(|e| e.ports)
                        .unwrap_or_default(),
                }
            }
        };
        Ok(self
            .registry
            .register(service, &placement.host, &ports, handle)?)
    }
}

/// Replica indices that were submitted, given the submission failures.
fn replica_indices(count: usize, failures: &[ReplicaFailure]) -> Vec<usize> {
    (0..count)
        .filter(|r| !failures.iter().any(|f| f.replica == *r))
        .collect()
}
