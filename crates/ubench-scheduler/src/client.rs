//! Where a benchmark client should send its load.

use tracing::debug;

use ubench_core::ClientRecipe;
use ubench_state::DiscoveryRegistry;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Port assumed when neither the recipe nor discovery names one.
const FALLBACK_PORT: u16 = 8000;

/// Resolve the URL a client recipe targets.
///
/// A direct `target.endpoint` wins: a full URL is used verbatim, a bare
/// `host:port` gets the recipe's protocol and path. Otherwise the recipe's
/// service name is looked up in the discovery registry.
pub fn client_target_url(
    recipe: &ClientRecipe,
    registry: &DiscoveryRegistry,
) -> OrchestratorResult<String> {
    let target = &recipe.target;
    let path = normalize_path(&target.path);

    if let Some(endpoint) = &target.endpoint {
        if endpoint.contains("://") {
            return Ok(endpoint.clone());
        }
        return Ok(format!("{}://{endpoint}{path}", target.protocol));
    }

    let service = recipe.service_name();
    let entry = registry
        .lookup(service)?
        .ok_or_else(|| OrchestratorError::DiscoveryMiss {
            service: service.to_string(),
        })?;
    let port = target
        .port
        .or_else(|| entry.primary_port())
        .unwrap_or(FALLBACK_PORT);
    debug!(%service, host = %entry.host, port, "client target discovered");
    Ok(format!("{}://{}:{port}{path}", target.protocol, entry.host))
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubench_core::{ClientOutput, ClientTarget, ResourceRequest, Workload, WorkloadPattern};

    fn recipe(target: ClientTarget) -> ClientRecipe {
        ClientRecipe {
            name: "load".to_string(),
            service_name: Some("vllm".to_string()),
            description: String::new(),
            target,
            workload: Workload {
                command: "bench".to_string(),
                pattern: WorkloadPattern::ClosedLoop,
                duration_seconds: 10,
                concurrent_users: 1,
                requests_per_user: 1,
                think_time_ms: 0,
            },
            output: ClientOutput::default(),
            payload: None,
            headers: Default::default(),
            dataset: None,
            resources: ResourceRequest::default(),
            env: Default::default(),
        }
    }

    fn http(path: &str) -> ClientTarget {
        ClientTarget {
            protocol: "http".to_string(),
            path: path.to_string(),
            ..ClientTarget::default()
        }
    }

    #[test]
    fn discovered_target() {
        let registry = DiscoveryRegistry::open_in_memory().unwrap();
        registry.register("vllm", "mel2013", &[8000], "1001").unwrap();
        let url = client_target_url(&recipe(http("v1/models")), &registry).unwrap();
        assert_eq!(url, "http://mel2013:8000/v1/models");
    }

    #[test]
    fn recipe_port_overrides_discovered_port() {
        let registry = DiscoveryRegistry::open_in_memory().unwrap();
        registry.register("vllm", "mel2013", &[8000], "1001").unwrap();
        let mut target = http("");
        target.port = Some(9000);
        let url = client_target_url(&recipe(target), &registry).unwrap();
        assert_eq!(url, "http://mel2013:9000");
    }

    #[test]
    fn endpoint_override_skips_discovery() {
        let registry = DiscoveryRegistry::open_in_memory().unwrap();
        let mut target = http("/health");
        target.endpoint = Some("10.1.2.3:8080".to_string());
        assert_eq!(
            client_target_url(&recipe(target.clone()), &registry).unwrap(),
            "http://10.1.2.3:8080/health"
        );

        target.endpoint = Some("https://api.example.org/v1".to_string());
        assert_eq!(
            client_target_url(&recipe(target), &registry).unwrap(),
            "https://api.example.org/v1"
        );
    }

    #[test]
    fn unregistered_service_is_a_discovery_miss() {
        let registry = DiscoveryRegistry::open_in_memory().unwrap();
        let err = client_target_url(&recipe(http("")), &registry).unwrap_err();
        assert!(matches!(err, OrchestratorError::DiscoveryMiss { ref service } if service == "vllm"));
    }
}
