//! ubench-monitor — collectors for deployed services.
//!
//! - [`ServiceKind`] maps a monitored service to the metrics worth exporting.
//! - [`TargetResolver`] turns a monitor recipe into concrete scrape targets.
//! - [`collector`] renders the Prometheus configuration and talks to a
//!   running collector over its HTTP API.
//! - [`export`] snapshots collected series into JSON or CSV files.
//! - [`MonitorLifecycle`] ties them together on top of the deployment
//!   orchestrator.

pub mod catalog;
pub mod collector;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod targets;

pub use catalog::{MetricQuery, ServiceKind};
pub use collector::{CollectorClient, PrometheusClient, QueryData};
pub use error::{MonitorError, MonitorResult};
pub use export::{ExportFormat, ExportKind, ExportRequest, TimeWindow};
pub use lifecycle::{MonitorLifecycle, MonitorSettings};
pub use targets::{Target, TargetResolver, TargetSource};
