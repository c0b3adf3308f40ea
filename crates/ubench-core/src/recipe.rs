//! Recipe documents.
//!
//! A recipe is a TOML document whose `kind` field selects one of three
//! shapes: a long-running inference `server`, a `monitor` that deploys a
//! metrics collector in front of one or more scrape targets, or a benchmark
//! `client` that drives load against a server. Recipes are immutable once
//! loaded and are validated before anything reaches the scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::duration::{is_slurm_time_limit, parse_duration};
use crate::error::{RecipeError, RecipeResult};

/// The three recipe shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Recipe {
    Server(ServerRecipe),
    Monitor(MonitorRecipe),
    Client(ClientRecipe),
}

/// Discriminant of [`Recipe`], also used to pick the catalog subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeKind {
    Server,
    Monitor,
    Client,
}

impl RecipeKind {
    pub const ALL: [RecipeKind; 3] = [RecipeKind::Server, RecipeKind::Monitor, RecipeKind::Client];

    /// Catalog subdirectory holding recipes of this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            RecipeKind::Server => "servers",
            RecipeKind::Monitor => "monitors",
            RecipeKind::Client => "clients",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecipeKind::Server => "server",
            RecipeKind::Monitor => "monitor",
            RecipeKind::Client => "client",
        }
    }
}

impl fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler resource request shared by every recipe kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default)]
    pub gpu_count: u32,
    /// Overrides the configured default partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Overrides the configured default time limit (`HH:MM:SS`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_memory_gb() -> u32 {
    4
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            memory_gb: default_memory_gb(),
            gpu_count: 0,
            partition: None,
            time_limit: None,
        }
    }
}

// ── Server ─────────────────────────────────────────────────────────

/// A long-running service published under a logical service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecipe {
    pub name: String,
    /// Logical name other recipes use to find this server. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub service: ServiceSpec,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Shell command started inside the batch job.
    pub command: String,
    /// Ports the service listens on. The first one is the primary port.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Container image; when set the command runs under `apptainer exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ServerRecipe {
    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.name)
    }
}

// ── Monitor ────────────────────────────────────────────────────────

/// A metrics collector scraping one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRecipe {
    pub name: String,
    /// Logical name of the monitored service. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Selects the exported metric set (`vllm`, `prometheus`, ...).
    /// Defaults to the service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_kind: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub collector: CollectorSpec,
    #[serde(default)]
    pub resources: ResourceRequest,
}

/// One declared scrape target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    /// Fixed `host:port`, used verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Scheduler job whose host should be scraped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Discovery name to look up. Defaults to the recipe's service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl TargetSpec {
    /// The implicit target used when a monitor declares none.
    pub fn implicit(service_name: &str) -> Self {
        Self {
            name: service_name.to_string(),
            endpoint: None,
            job_id: None,
            service: None,
            port: None,
            metrics_path: default_metrics_path(),
        }
    }
}

/// Collector (Prometheus) deployment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSpec {
    #[serde(default = "default_collector_image")]
    pub image: String,
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: String,
    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default = "default_collector_port")]
    pub port: u16,
}

fn default_collector_image() -> String {
    "docker://prom/prometheus:latest".to_string()
}

fn default_scrape_interval() -> String {
    "15s".to_string()
}

fn default_retention() -> String {
    "24h".to_string()
}

fn default_collector_port() -> u16 {
    9090
}

impl Default for CollectorSpec {
    fn default() -> Self {
        Self {
            image: default_collector_image(),
            scrape_interval: default_scrape_interval(),
            retention: default_retention(),
            port: default_collector_port(),
        }
    }
}

impl MonitorRecipe {
    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.name)
    }

    pub fn service_kind(&self) -> &str {
        self.service_kind.as_deref().unwrap_or(self.service_name())
    }

    /// Declared targets, or a single implicit target named after the service.
    pub fn effective_targets(&self) -> Vec<TargetSpec> {
        if self.targets.is_empty() {
            vec![TargetSpec::implicit(self.service_name())]
        } else {
            self.targets.clone()
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// A benchmark client driving load against a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecipe {
    pub name: String,
    /// Logical name of the server under test. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: ClientTarget,
    pub workload: Workload,
    #[serde(default)]
    pub output: ClientOutput,
    /// Request body sent by the load generator. Takes precedence over
    /// `dataset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<toml::Table>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetSpec>,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientTarget {
    /// Direct-endpoint override (`host:port` or a URL). Skips discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub path: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadPattern {
    ClosedLoop,
    OpenLoop,
}

impl WorkloadPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadPattern::ClosedLoop => "closed-loop",
            WorkloadPattern::OpenLoop => "open-loop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Load generator command. Receives the target through `UBENCH_TARGET_URL`.
    pub command: String,
    #[serde(default = "default_pattern")]
    pub pattern: WorkloadPattern,
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
    #[serde(default = "default_one")]
    pub concurrent_users: u32,
    #[serde(default = "default_requests_per_user")]
    pub requests_per_user: u32,
    #[serde(default)]
    pub think_time_ms: u64,
}

fn default_pattern() -> WorkloadPattern {
    WorkloadPattern::ClosedLoop
}

fn default_duration_seconds() -> u64 {
    60
}

fn default_one() -> u32 {
    1
}

fn default_requests_per_user() -> u32 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientOutput {
    /// Results directory handed to the client through `UBENCH_OUTPUT_DIR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// Where request bodies come from when no explicit payload is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    #[serde(rename = "type", default = "default_dataset_type")]
    pub kind: String,
    #[serde(default)]
    pub params: toml::Table,
}

fn default_dataset_type() -> String {
    "synthetic".to_string()
}

impl DatasetSpec {
    /// Parameters naming a `model_name` become a completion request with
    /// sampling defaults filled in. Anything else is sent as given.
    pub fn payload(&self) -> toml::Table {
        let params = &self.params;
        let Some(model) = params.get("model_name") else {
            return params.clone();
        };
        let param = |key: &str, default: toml::Value| params.get(key).cloned().unwrap_or(default);
        let mut body = toml::Table::new();
        body.insert("model".to_string(), model.clone());
        body.insert("prompt".to_string(), param("prompt", "Once upon a time".into()));
        body.insert("max_tokens".to_string(), param("max_tokens", toml::Value::Integer(20)));
        body.insert("temperature".to_string(), param("temperature", toml::Value::Float(0.7)));
        body.insert("top_p".to_string(), param("top_p", toml::Value::Float(1.0)));
        body
    }
}

impl ClientRecipe {
    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.name)
    }

    /// The body each request carries: the explicit payload, else one built
    /// from the dataset, else nothing.
    pub fn request_payload(&self) -> Option<toml::Table> {
        match &self.payload {
            Some(payload) if !payload.is_empty() => Some(payload.clone()),
            _ => self.dataset.as_ref().map(DatasetSpec::payload),
        }
    }
}

// ── Loading and validation ─────────────────────────────────────────

impl Recipe {
    /// Parse and validate a recipe document. `origin` is only used in errors.
    pub fn from_toml_str(content: &str, origin: &Path) -> RecipeResult<Self> {
        let recipe: Recipe = toml::from_str(content).map_err(|e| RecipeError::Parse {
            path: origin.to_path_buf(),
            message: e.message().to_string(),
        })?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn from_file(path: &Path) -> RecipeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    pub fn to_toml_string(&self) -> RecipeResult<String> {
        toml::to_string_pretty(self).map_err(|e| RecipeError::invalid(self.name(), e.to_string()))
    }

    pub fn kind(&self) -> RecipeKind {
        match self {
            Recipe::Server(_) => RecipeKind::Server,
            Recipe::Monitor(_) => RecipeKind::Monitor,
            Recipe::Client(_) => RecipeKind::Client,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Recipe::Server(r) => &r.name,
            Recipe::Monitor(r) => &r.name,
            Recipe::Client(r) => &r.name,
        }
    }

    pub fn service_name(&self) -> &str {
        match self {
            Recipe::Server(r) => r.service_name(),
            Recipe::Monitor(r) => r.service_name(),
            Recipe::Client(r) => r.service_name(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Recipe::Server(r) => &r.description,
            Recipe::Monitor(r) => &r.description,
            Recipe::Client(r) => &r.description,
        }
    }

    pub fn resources(&self) -> &ResourceRequest {
        match self {
            Recipe::Server(r) => &r.resources,
            Recipe::Monitor(r) => &r.resources,
            Recipe::Client(r) => &r.resources,
        }
    }

    /// Check the structural rules serde cannot express.
    pub fn validate(&self) -> RecipeResult<()> {
        let name = self.name();
        if name.trim().is_empty() {
            return Err(RecipeError::invalid(name, "name must not be empty"));
        }
        if name.contains(['/', '\\']) {
            return Err(RecipeError::invalid(name, "name must not contain path separators"));
        }
        if self.service_name().trim().is_empty() {
            return Err(RecipeError::invalid(name, "service_name must not be empty"));
        }
        validate_resources(name, self.resources())?;

        match self {
            Recipe::Server(r) => validate_server(r),
            Recipe::Monitor(r) => validate_monitor(r),
            Recipe::Client(r) => validate_client(r),
        }
    }
}

fn validate_resources(name: &str, res: &ResourceRequest) -> RecipeResult<()> {
    if res.cpu_cores == 0 {
        return Err(RecipeError::invalid(name, "resources.cpu_cores must be at least 1"));
    }
    if res.memory_gb == 0 {
        return Err(RecipeError::invalid(name, "resources.memory_gb must be at least 1"));
    }
    if let Some(limit) = &res.time_limit {
        if !is_slurm_time_limit(limit) {
            return Err(RecipeError::invalid(
                name,
                format!("resources.time_limit '{limit}' is not a valid time limit (HH:MM:SS)"),
            ));
        }
    }
    Ok(())
}

fn validate_server(r: &ServerRecipe) -> RecipeResult<()> {
    if r.service.command.trim().is_empty() {
        return Err(RecipeError::invalid(&r.name, "service.command must not be empty"));
    }
    if r.service.ports.is_empty() {
        return Err(RecipeError::invalid(&r.name, "service.ports must list at least one port"));
    }
    if r.service.ports.contains(&0) {
        return Err(RecipeError::invalid(&r.name, "service.ports must be between 1 and 65535"));
    }
    Ok(())
}

fn validate_monitor(r: &MonitorRecipe) -> RecipeResult<()> {
    for target in &r.targets {
        if target.name.trim().is_empty() {
            return Err(RecipeError::invalid(&r.name, "every target needs a name"));
        }
        if target.port == Some(0) {
            return Err(RecipeError::invalid(
                &r.name,
                format!("target '{}' has port 0", target.name),
            ));
        }
        if !target.metrics_path.starts_with('/') {
            return Err(RecipeError::invalid(
                &r.name,
                format!("target '{}' metrics_path must start with '/'", target.name),
            ));
        }
    }
    if parse_duration(&r.collector.scrape_interval).is_none() {
        return Err(RecipeError::invalid(
            &r.name,
            format!("collector.scrape_interval '{}' is not a duration", r.collector.scrape_interval),
        ));
    }
    if parse_duration(&r.collector.retention).is_none() {
        return Err(RecipeError::invalid(
            &r.name,
            format!("collector.retention '{}' is not a duration", r.collector.retention),
        ));
    }
    if r.collector.port == 0 {
        return Err(RecipeError::invalid(&r.name, "collector.port must be between 1 and 65535"));
    }
    Ok(())
}

fn validate_client(r: &ClientRecipe) -> RecipeResult<()> {
    if r.workload.command.trim().is_empty() {
        return Err(RecipeError::invalid(&r.name, "workload.command must not be empty"));
    }
    if r.workload.duration_seconds == 0 {
        return Err(RecipeError::invalid(&r.name, "workload.duration_seconds must be positive"));
    }
    if r.workload.concurrent_users == 0 {
        return Err(RecipeError::invalid(&r.name, "workload.concurrent_users must be positive"));
    }
    if r.target.port == Some(0) {
        return Err(RecipeError::invalid(&r.name, "target.port must be between 1 and 65535"));
    }
    for (name, value) in &r.headers {
        if !is_header_name(name) {
            return Err(RecipeError::invalid(
                &r.name,
                format!("headers: '{name}' is not a valid HTTP header name"),
            ));
        }
        if value.contains(['\r', '\n']) {
            return Err(RecipeError::invalid(
                &r.name,
                format!("headers: value of '{name}' must be a single line"),
            ));
        }
    }
    if let Some(dataset) = &r.dataset {
        if dataset.kind.trim().is_empty() {
            return Err(RecipeError::invalid(&r.name, "dataset.type must not be empty"));
        }
        if r.payload.is_none() && dataset.params.is_empty() {
            return Err(RecipeError::invalid(
                &r.name,
                "dataset.params must not be empty when no payload is given",
            ));
        }
    }
    Ok(())
}

/// RFC 9110 token characters.
fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
}
