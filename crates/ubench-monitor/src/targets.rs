//! TargetResolver: from a monitor recipe to `host:port` scrape targets.
//!
//! Each declared target resolves through the first source that applies:
//!
//! 1. a fixed `endpoint`, used verbatim (scheme and path stripped);
//! 2. a job handle, either passed positionally by the caller or the
//!    target's own `job_id`, located through the scheduler;
//! 3. the discovery registry, by the target's `service` or else the
//!    recipe's service name.
//!
//! Targets that resolve through none of them are skipped with a warning.
//! Resolving nothing at all is an error, never an empty success.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ubench_core::{MonitorRecipe, TargetSpec};
use ubench_scheduler::{PlacementResolver, Resolution};
use ubench_state::DiscoveryRegistry;

use crate::error::{MonitorError, MonitorResult};

/// Port scraped when neither the recipe nor discovery names one.
pub const FALLBACK_PORT: u16 = 8000;

/// Where a resolved target came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "lowercase")]
pub enum TargetSource {
    Endpoint,
    Job { handle: String },
    Discovery { service: String },
}

/// A concrete scrape target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// `host:port`.
    pub address: String,
    pub metrics_path: String,
    pub source: TargetSource,
}

pub struct TargetResolver<'a> {
    placement: &'a PlacementResolver,
    registry: &'a DiscoveryRegistry,
}

impl<'a> TargetResolver<'a> {
    pub fn new(placement: &'a PlacementResolver, registry: &'a DiscoveryRegistry) -> Self {
        Self {
            placement,
            registry,
        }
    }

    /// Resolve every target of `recipe`. `job_handles[i]` pairs with the
    /// i-th declared target.
    pub async fn resolve(
        &self,
        recipe: &MonitorRecipe,
        job_handles: &[String],
    ) -> MonitorResult<Vec<Target>> {
        let specs = recipe.effective_targets();
        if job_handles.len() > specs.len() {
            warn!(
                monitor = %recipe.name,
                targets = specs.len(),
                handles = job_handles.len(),
                "more job ids than targets, extra ids ignored"
            );
        }

        let mut resolved = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let handle = job_handles.get(i).or(spec.job_id.as_ref());
            match self.resolve_one(recipe, spec, handle.map(String::as_str)).await? {
                Some(target) => {
                    debug!(monitor = %recipe.name, target = %target.name, address = %target.address, "target resolved");
                    resolved.push(target);
                }
                None => warn!(monitor = %recipe.name, target = %spec.name, "target could not be resolved, skipping"),
            }
        }

        if resolved.is_empty() {
            return Err(MonitorError::NoTargetsResolved {
                monitor: recipe.name.clone(),
            });
        }
        info!(monitor = %recipe.name, count = resolved.len(), "scrape targets resolved");
        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        recipe: &MonitorRecipe,
        spec: &TargetSpec,
        handle: Option<&str>,
    ) -> MonitorResult<Option<Target>> {
        let service = spec.service.as_deref().unwrap_or(recipe.service_name());

        if let Some(endpoint) = &spec.endpoint {
            return Ok(Some(self.target(spec, strip_endpoint(endpoint), TargetSource::Endpoint)));
        }

        if let Some(handle) = handle {
            let host = match self.placement.resolve(handle).await {
                Ok(Resolution::Resolved(placement)) => Some(placement.host),
                Ok(Resolution::Pending) => {
                    warn!(%handle, target = %spec.name, "job has no host yet");
                    None
                }
                Ok(Resolution::Failed(reason)) => {
                    warn!(%handle, target = %spec.name, %reason, "job will not be placed");
                    None
                }
                Err(e) => {
                    warn!(%handle, target = %spec.name, error = %e, "could not query job");
                    None
                }
            };
            let Some(host) = host else {
                return Ok(None);
            };
            let discovered = self
                .registry
                .lookup(service)?
                .and_then(|e| e.primary_port());
            let port = spec.port.or(discovered).unwrap_or(FALLBACK_PORT);
            return Ok(Some(self.target(
                spec,
                format!("{host}:{port}"),
                TargetSource::Job {
                    handle: handle.to_string(),
                },
            )));
        }

        let Some(entry) = self.registry.lookup(service)? else {
            warn!(%service, target = %spec.name, "service not registered");
            return Ok(None);
        };
        let port = spec
            .port
            .or_else(|| entry.primary_port())
            .unwrap_or(FALLBACK_PORT);
        Ok(Some(self.target(
            spec,
            format!("{}:{port}", entry.host),
            TargetSource::Discovery {
                service: service.to_string(),
            },
        )))
    }

    fn target(&self, spec: &TargetSpec, address: String, source: TargetSource) -> Target {
        Target {
            name: spec.name.clone(),
            address,
            metrics_path: spec.metrics_path.clone(),
            source,
        }
    }
}

/// `http://10.0.0.5:8000/metrics` → `10.0.0.5:8000`.
fn strip_endpoint(endpoint: &str) -> String {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ubench_core::{CollectorSpec, ResourceRequest};
    use ubench_scheduler::JobStatus;
    use ubench_scheduler::fake::FakeScheduler;

    fn monitor(targets: Vec<TargetSpec>) -> MonitorRecipe {
        MonitorRecipe {
            name: "vllm-monitor".to_string(),
            service_name: Some("vllm".to_string()),
            description: String::new(),
            service_kind: None,
            targets,
            collector: CollectorSpec::default(),
            resources: ResourceRequest::default(),
        }
    }

    fn spec(name: &str) -> TargetSpec {
        TargetSpec::implicit(name)
    }

    struct Fixture {
        fake: Arc<FakeScheduler>,
        placement: PlacementResolver,
        registry: DiscoveryRegistry,
    }

    fn fixture() -> Fixture {
        let fake = Arc::new(FakeScheduler::new());
        Fixture {
            placement: PlacementResolver::new(fake.clone()),
            fake,
            registry: DiscoveryRegistry::open_in_memory().unwrap(),
        }
    }

    #[tokio::test]
    async fn implicit_target_from_discovery() {
        let f = fixture();
        f.registry.register("vllm", "mel2013", &[8000], "1001").unwrap();
        let targets = TargetResolver::new(&f.placement, &f.registry)
            .resolve(&monitor(vec![]), &[])
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "vllm");
        assert_eq!(targets[0].address, "mel2013:8000");
        assert_eq!(targets[0].metrics_path, "/metrics");
        assert_eq!(
            targets[0].source,
            TargetSource::Discovery {
                service: "vllm".to_string()
            }
        );
    }

    #[tokio::test]
    async fn endpoint_wins_and_is_stripped() {
        let f = fixture();
        f.registry.register("vllm", "mel2013", &[8000], "1001").unwrap();
        let mut t = spec("fixed");
        t.endpoint = Some("http://10.0.0.5:9100/metrics".to_string());
        let targets = TargetResolver::new(&f.placement, &f.registry)
            .resolve(&monitor(vec![t]), &["1001".to_string()])
            .await
            .unwrap();
        assert_eq!(targets[0].address, "10.0.0.5:9100");
        assert_eq!(targets[0].source, TargetSource::Endpoint);
    }

    #[tokio::test]
    async fn positional_job_handles_override_discovery() {
        let f = fixture();
        f.fake.script("2001", vec![JobStatus::running("mel3001")]);
        f.fake.script("2002", vec![JobStatus::running("mel3002")]);
        let mut second = spec("b");
        second.port = Some(9400);
        let targets = TargetResolver::new(&f.placement, &f.registry)
            .resolve(
                &monitor(vec![spec("a"), second]),
                &["2001".to_string(), "2002".to_string()],
            )
            .await
            .unwrap();
        let addresses: Vec<_> = targets.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, vec!["mel3001:8000", "mel3002:9400"]);
    }

    #[tokio::test]
    async fn recipe_job_id_and_shared_host() {
        let f = fixture();
        f.fake.script("3000", vec![JobStatus::running("mel4000")]);
        let mut a = spec("api");
        a.job_id = Some("3000".to_string());
        a.port = Some(8000);
        let mut b = spec("exporter");
        b.job_id = Some("3000".to_string());
        b.port = Some(9100);
        let targets = TargetResolver::new(&f.placement, &f.registry)
            .resolve(&monitor(vec![a, b]), &[])
            .await
            .unwrap();
        assert_eq!(targets[0].address, "mel4000:8000");
        assert_eq!(targets[1].address, "mel4000:9100");
    }

    #[tokio::test]
    async fn unresolvable_targets_are_skipped() {
        let f = fixture();
        f.registry.register("vllm", "mel2013", &[], "1").unwrap();
        f.fake.script("4000", vec![JobStatus::pending()]);
        let mut pending = spec("pending");
        pending.job_id = Some("4000".to_string());
        let targets = TargetResolver::new(&f.placement, &f.registry)
            .resolve(&monitor(vec![pending, spec("vllm")]), &[])
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address, format!("mel2013:{FALLBACK_PORT}"));
    }

    #[tokio::test]
    async fn nothing_resolved_is_an_error() {
        let f = fixture();
        let err = TargetResolver::new(&f.placement, &f.registry)
            .resolve(&monitor(vec![]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NoTargetsResolved { ref monitor } if monitor == "vllm-monitor"));
    }

    #[test]
    fn strip_endpoint_forms() {
        assert_eq!(strip_endpoint("mel1:80"), "mel1:80");
        assert_eq!(strip_endpoint("https://mel1:443/x/y"), "mel1:443");
        assert_eq!(strip_endpoint("mel1:80/metrics"), "mel1:80");
    }
}
