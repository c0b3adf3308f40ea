//! Which metrics to export for which kind of service.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// `(metric name, description)` pairs.
type MetricTable = &'static [(&'static str, &'static str)];

/// Exported for every service.
const COMMON: MetricTable = &[
    ("process_cpu_seconds_total", "Total CPU time"),
    ("process_resident_memory_bytes", "Resident memory in bytes"),
    ("process_virtual_memory_bytes", "Virtual memory in bytes"),
    ("http_request_duration_seconds", "HTTP request duration"),
    ("http_requests_total", "Total HTTP requests"),
];

const VLLM: MetricTable = &[
    ("vllm_requests_total", "Total number of requests"),
    ("vllm_request_duration_seconds", "Request duration in seconds"),
    ("vllm_time_to_first_token_seconds", "Time to first token in seconds"),
    ("vllm_time_per_output_token_seconds", "Time per output token in seconds"),
    ("vllm_num_requests_running", "Number of running requests"),
    ("vllm_num_requests_waiting", "Number of waiting requests"),
    ("vllm_gpu_cache_usage_perc", "GPU cache usage percentage"),
    ("vllm_cpu_cache_usage_perc", "CPU cache usage percentage"),
];

const PROMETHEUS: MetricTable = &[
    ("prometheus_tsdb_head_series", "Total number of series in the head block"),
    ("prometheus_tsdb_head_samples_appended_total", "Total number of samples appended"),
    ("prometheus_http_requests_total", "Total HTTP requests"),
];

/// Service kinds with a dedicated metric set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Vllm,
    Prometheus,
    /// Anything else: common metrics only.
    Generic,
}

impl ServiceKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "vllm" => Self::Vllm,
            "prometheus" => Self::Prometheus,
            _ => Self::Generic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vllm => "vllm",
            Self::Prometheus => "prometheus",
            Self::Generic => "generic",
        }
    }

    fn specific(self) -> MetricTable {
        match self {
            Self::Vllm => VLLM,
            Self::Prometheus => PROMETHEUS,
            Self::Generic => &[],
        }
    }

    /// Common metrics followed by the kind-specific ones.
    pub fn queries(self) -> Vec<MetricQuery> {
        let specific = self.specific();
        debug!(kind = %self, specific = specific.len(), "selected metric set");
        COMMON
            .iter()
            .chain(specific)
            .map(|(name, description)| MetricQuery::new(*name, *description))
            .collect()
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One PromQL expression to export, with a human description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    pub description: String,
}

impl MetricQuery {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Parse `name[:description],...`. A missing description repeats the name.
    pub fn parse_list(spec: &str) -> Vec<MetricQuery> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| match item.split_once(':') {
                Some((name, desc)) if !desc.trim().is_empty() => {
                    MetricQuery::new(name.trim(), desc.trim())
                }
                Some((name, _)) => MetricQuery::new(name.trim(), name.trim()),
                None => MetricQuery::new(item, item),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(kind: ServiceKind) -> Vec<String> {
        kind.queries().into_iter().map(|q| q.name).collect()
    }

    #[test]
    fn vllm_includes_common_subset() {
        let names = names(ServiceKind::Vllm);
        assert_eq!(names.len(), COMMON.len() + VLLM.len());
        assert!(names.contains(&"process_cpu_seconds_total".to_string()));
        assert!(names.contains(&"vllm_time_to_first_token_seconds".to_string()));
    }

    #[test]
    fn unknown_service_gets_common_only() {
        assert_eq!(ServiceKind::from_name("ollama"), ServiceKind::Generic);
        assert_eq!(names(ServiceKind::Generic).len(), COMMON.len());
    }

    #[test]
    fn kind_names_are_case_insensitive() {
        assert_eq!(ServiceKind::from_name("vLLM"), ServiceKind::Vllm);
        assert_eq!(ServiceKind::from_name(" prometheus "), ServiceKind::Prometheus);
    }

    #[test]
    fn parse_custom_query_list() {
        let queries = MetricQuery::parse_list("up:Target health, rate(http_requests_total[5m]) ,foo:,");
        assert_eq!(
            queries,
            vec![
                MetricQuery::new("up", "Target health"),
                MetricQuery::new("rate(http_requests_total[5m])", "rate(http_requests_total[5m])"),
                MetricQuery::new("foo", "foo"),
            ]
        );
        assert!(MetricQuery::parse_list(" , ").is_empty());
    }
}
