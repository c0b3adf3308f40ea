//! Persisted domain types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Metadata key holding a collector's query base URL.
pub const META_COLLECTOR_URL: &str = "collector_url";
/// Metadata key holding a collector's resolved scrape targets.
pub const META_TARGETS: &str = "targets";
/// Metadata key holding the collector's service kind (metric set).
pub const META_SERVICE_KIND: &str = "service_kind";
/// Metadata key holding the collector port.
pub const META_COLLECTOR_PORT: &str = "collector_port";
/// Metadata key holding the scheduler state a job ended in.
pub const META_TERMINAL_STATE: &str = "terminal_state";
/// Metadata key holding a human readable failure reason.
pub const META_REASON: &str = "reason";

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What a tracked instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Server,
    Collector,
    Client,
}

impl InstanceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceKind::Server => "server",
            InstanceKind::Collector => "collector",
            InstanceKind::Client => "client",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance lifecycle.
///
/// `Created → Submitted → Pending → Running → Stopped`, with `Failed`
/// reachable from `Submitted`, `Pending` and `Running`, and `Stopped`
/// reachable from any non-terminal state. `Stopped` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Created,
    Submitted,
    Pending,
    Running,
    Stopped,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            InstanceStatus::Created => 0,
            InstanceStatus::Submitted => 1,
            InstanceStatus::Pending => 2,
            InstanceStatus::Running => 3,
            InstanceStatus::Stopped | InstanceStatus::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            InstanceStatus::Stopped => true,
            InstanceStatus::Failed => self != InstanceStatus::Created,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Created => "CREATED",
            InstanceStatus::Submitted => "SUBMITTED",
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(InstanceStatus::Created),
            "SUBMITTED" => Ok(InstanceStatus::Submitted),
            "PENDING" => Ok(InstanceStatus::Pending),
            "RUNNING" => Ok(InstanceStatus::Running),
            "STOPPED" => Ok(InstanceStatus::Stopped),
            "FAILED" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// One deployed unit tracked across invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub recipe_name: String,
    pub service_name: String,
    pub kind: InstanceKind,
    /// Scheduler job handle.
    pub handle: String,
    pub status: InstanceStatus,
    /// Compute host, set once the job is placed.
    pub host: Option<String>,
    pub ports: Vec<u16>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Instance {
    /// A freshly submitted instance.
    pub fn submitted(
        id: impl Into<String>,
        recipe_name: impl Into<String>,
        service_name: impl Into<String>,
        kind: InstanceKind,
        handle: impl Into<String>,
        ports: Vec<u16>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            recipe_name: recipe_name.into(),
            service_name: service_name.into(),
            kind,
            handle: handle.into(),
            status: InstanceStatus::Submitted,
            host: None,
            ports,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Apply a forward transition. Returns false and leaves the record
    /// untouched when the move would go backwards, leave a terminal state,
    /// or reach `Running` without a host.
    pub fn advance(&mut self, next: InstanceStatus, host: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == InstanceStatus::Running {
            match host {
                Some(host) => self.host = Some(host),
                None if self.host.is_some() => {}
                None => return false,
            }
        }
        self.status = next;
        self.updated_at = epoch_secs();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `host:port` on the primary port, once placed.
    pub fn address(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let port = self.ports.first()?;
        Some(format!("{host}:{port}"))
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
        self.updated_at = epoch_secs();
    }

    pub fn collector_url(&self) -> Option<&str> {
        self.metadata_str(META_COLLECTOR_URL)
    }
}

/// Last known placement of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub service_name: String,
    pub host: String,
    pub ports: Vec<u16>,
    pub handle: String,
    pub updated_at: u64,
}

impl DiscoveryEntry {
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }
}
