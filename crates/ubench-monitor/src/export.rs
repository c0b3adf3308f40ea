//! Metric snapshots: query a collector, write JSON or CSV.
//!
//! Exports are a pure read path. The document is assembled in memory and
//! written through a temporary file and a rename, so a failed export never
//! leaves a partial file behind.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::MetricQuery;
use crate::collector::{CollectorClient, QueryData, RangeBounds, step_param};
use crate::error::{MonitorError, MonitorResult};

const NO_DATA: &str = "No data available";

/// Which query API to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportKind {
    /// Current values.
    #[default]
    Instant,
    /// Series over a time window.
    Range,
    /// Both; range series land in `range_metrics`.
    All,
}

impl ExportKind {
    fn wants_instant(self) -> bool {
        matches!(self, Self::Instant | Self::All)
    }

    fn wants_range(self) -> bool {
        matches!(self, Self::Range | Self::All)
    }
}

impl FromStr for ExportKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instant" => Ok(Self::Instant),
            "range" => Ok(Self::Range),
            "all" => Ok(Self::All),
            other => Err(MonitorError::Invalid(format!(
                "unknown export type '{other}' (expected instant, range or all)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(MonitorError::Invalid(format!(
                "unknown export format '{other}' (expected json or csv)"
            ))),
        }
    }
}

/// Range query window. Missing bounds default to the hour before now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub step: Duration,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            step: Duration::from_secs(15),
        }
    }
}

impl TimeWindow {
    /// Concrete `(start, end)` relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> MonitorResult<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.end.unwrap_or(now);
        let start = self.start.unwrap_or(end - chrono::Duration::hours(1));
        if start >= end {
            return Err(MonitorError::Invalid(format!(
                "range start {} is not before end {}",
                rfc3339(start),
                rfc3339(end)
            )));
        }
        if self.step < Duration::from_millis(1) {
            return Err(MonitorError::Invalid(format!(
                "range step {:?} is below the 1ms resolution of the query API",
                self.step
            )));
        }
        Ok((start, end))
    }
}

/// What to export and where.
#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub kind: ExportKind,
    pub format: ExportFormat,
    /// Output file. Defaults to a timestamped name in the export directory.
    pub output: Option<PathBuf>,
    /// Replaces the service kind's metric set when given.
    pub queries: Option<Vec<MetricQuery>>,
    pub window: TimeWindow,
}

// ── Document ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub exported_at: String,
    pub collector_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub metrics: BTreeMap<String, MetricResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_metrics: Option<BTreeMap<String, MetricResult>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub description: String,
    pub result_type: String,
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricResult {
    fn from_query(description: &str, expected_type: &str, outcome: MonitorResult<QueryData>) -> MonitorResult<Self> {
        match outcome {
            Ok(data) if !data.result.is_empty() => Ok(Self {
                description: description.to_string(),
                result_type: data.result_type,
                values: data.result,
                error: None,
            }),
            Ok(data) => Ok(Self::failed(description, &data.result_type, NO_DATA.to_string())),
            // Losing the collector mid-export fails the whole export.
            Err(e @ MonitorError::CollectorUnreachable { .. }) => Err(e),
            Err(e) => Ok(Self::failed(description, expected_type, e.to_string())),
        }
    }

    fn failed(description: &str, result_type: &str, error: String) -> Self {
        Self {
            description: description.to_string(),
            result_type: result_type.to_string(),
            values: Vec::new(),
            error: Some(error),
        }
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn unix_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Query every metric and assemble the document.
///
/// Fails with [`MonitorError::CollectorUnreachable`] when the collector
/// does not answer; individual query errors are recorded per metric.
pub async fn collect(
    client: &dyn CollectorClient,
    collector_url: &str,
    queries: &[MetricQuery],
    request: &ExportRequest,
    now: DateTime<Utc>,
) -> MonitorResult<ExportDocument> {
    if queries.is_empty() {
        return Err(MonitorError::Invalid("no metrics to export".to_string()));
    }
    let window = if request.kind.wants_range() {
        Some(request.window.resolve(now)?)
    } else {
        None
    };

    // Fail fast, before any per-metric work, if nothing is listening.
    match client.instant(collector_url, "up").await {
        Err(e @ MonitorError::CollectorUnreachable { .. }) => return Err(e),
        Err(e) => debug!(error = %e, "probe query rejected, continuing"),
        Ok(_) => {}
    }

    let mut instant = BTreeMap::new();
    if request.kind.wants_instant() {
        for q in queries {
            debug!(metric = %q.name, "instant query");
            let outcome = client.instant(collector_url, &q.name).await;
            instant.insert(q.name.clone(), MetricResult::from_query(&q.description, "vector", outcome)?);
        }
    }

    let mut range = BTreeMap::new();
    let mut time_range = None;
    if let Some((start, end)) = window {
        let bounds = RangeBounds {
            start: unix_secs(start),
            end: unix_secs(end),
            step: request.window.step,
        };
        time_range = Some(TimeRange {
            start: rfc3339(start),
            end: rfc3339(end),
            step: step_param(request.window.step),
        });
        for q in queries {
            debug!(metric = %q.name, "range query");
            let outcome = client.range(collector_url, &q.name, bounds).await;
            range.insert(q.name.clone(), MetricResult::from_query(&q.description, "matrix", outcome)?);
        }
    }

    let missing = instant
        .values()
        .chain(range.values())
        .filter(|m| m.error.is_some())
        .count();
    if missing > 0 {
        warn!(%collector_url, missing, "some metrics returned no data");
    }

    let (metrics, range_metrics) = match request.kind {
        ExportKind::Instant => (instant, None),
        ExportKind::Range => (range, None),
        ExportKind::All => (instant, Some(range)),
    };
    Ok(ExportDocument {
        exported_at: rfc3339(now),
        collector_url: collector_url.to_string(),
        time_range,
        metrics,
        range_metrics,
    })
}

// ── Rendering ──────────────────────────────────────────────────────

pub const CSV_HEADER: &str = "Metric,Description,Labels,Value,Timestamp";

/// One row per instant sample or range point, errors as `ERROR` rows.
pub fn render_csv(doc: &ExportDocument) -> String {
    let mut out = String::new();
    out.push_str(CSV_HEADER);
    out.push('\n');
    let sections = std::iter::once(&doc.metrics).chain(doc.range_metrics.as_ref());
    for metrics in sections {
        for (name, metric) in metrics {
            if metric.error.is_some() {
                push_row(&mut out, [name.as_str(), &metric.description, "", "ERROR", ""]);
                continue;
            }
            for item in &metric.values {
                let labels = item.get("metric").map(Value::to_string).unwrap_or_default();
                for (ts, value) in sample_points(item) {
                    push_row(&mut out, [name.as_str(), &metric.description, &labels, &value, &ts]);
                }
            }
        }
    }
    out
}

/// `(timestamp, value)` pairs of one result item, whatever its shape.
fn sample_points(item: &Value) -> Vec<(String, String)> {
    let point = |p: &Value| -> Option<(String, String)> {
        let ts = p.get(0)?.as_f64()?;
        let value = match p.get(1)? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some((format_timestamp(ts), value))
    };
    if let Some(values) = item.get("values").and_then(Value::as_array) {
        values.iter().filter_map(point).collect()
    } else if let Some(value) = item.get("value") {
        point(value).into_iter().collect()
    } else {
        // Scalar and string results are bare `[ts, value]` pairs.
        point(item).into_iter().collect()
    }
}

fn format_timestamp(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let nanos = ((ts.fract() * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(secs, nanos)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| ts.to_string())
}

fn push_row(out: &mut String, fields: [&str; 5]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

pub fn render(doc: &ExportDocument, format: ExportFormat) -> MonitorResult<Vec<u8>> {
    Ok(match format {
        ExportFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(doc)?;
            bytes.push(b'\n');
            bytes
        }
        ExportFormat::Csv => render_csv(doc).into_bytes(),
    })
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
///
/// The temp name is unique per call, so concurrent exports to one path
/// each land whole and the last rename wins.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    let tmp = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Collect, render and write one export.
pub async fn export_to(
    client: &dyn CollectorClient,
    collector_url: &str,
    queries: &[MetricQuery],
    request: &ExportRequest,
    path: &Path,
) -> MonitorResult<PathBuf> {
    let doc = collect(client, collector_url, queries, request, Utc::now()).await?;
    let bytes = render(&doc, request.format)?;
    write_atomic(path, &bytes)?;
    info!(path = %path.display(), metrics = queries.len(), format = %request.format, "metrics exported");
    Ok(path.to_path_buf())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::json;
    use ubench_scheduler::BoxFuture;

    /// Canned collector: known metrics answer, the rest return no data.
    #[derive(Default)]
    pub(crate) struct FakeCollector {
        pub(crate) down: bool,
        pub(crate) instant: HashMap<String, Vec<Value>>,
        pub(crate) range: HashMap<String, Vec<Value>>,
        pub(crate) rejected: Vec<String>,
        pub(crate) reloads: Mutex<Vec<String>>,
    }

    impl FakeCollector {
        fn answer(&self, url: &str, query: &str, table: &HashMap<String, Vec<Value>>, kind: &str) -> MonitorResult<QueryData> {
            if self.down {
                return Err(MonitorError::CollectorUnreachable {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            if self.rejected.iter().any(|r| r == query) {
                return Err(MonitorError::Query {
                    query: query.to_string(),
                    message: "parse error".to_string(),
                });
            }
            Ok(QueryData {
                result_type: kind.to_string(),
                result: table.get(query).cloned().unwrap_or_default(),
            })
        }
    }

    impl CollectorClient for FakeCollector {
        fn instant<'a>(&'a self, base_url: &'a str, query: &'a str) -> BoxFuture<'a, MonitorResult<QueryData>> {
            Box::pin(async move { self.answer(base_url, query, &self.instant, "vector") })
        }

        fn range<'a>(&'a self, base_url: &'a str, query: &'a str, _bounds: RangeBounds) -> BoxFuture<'a, MonitorResult<QueryData>> {
            Box::pin(async move { self.answer(base_url, query, &self.range, "matrix") })
        }

        fn reload<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, MonitorResult<()>> {
            Box::pin(async move {
                if self.down {
                    return Err(MonitorError::CollectorUnreachable {
                        url: base_url.to_string(),
                        reason: "connection refused".to_string(),
                    });
                }
                self.reloads.lock().unwrap().push(base_url.to_string());
                Ok(())
            })
        }
    }

    pub(crate) fn healthy_collector() -> FakeCollector {
        let mut fake = FakeCollector::default();
        fake.instant.insert(
            "vllm_num_requests_running".to_string(),
            vec![json!({"metric": {"job": "vllm", "instance": "mel2013:8000"}, "value": [1700000000.5, "3"]})],
        );
        fake.range.insert(
            "vllm_num_requests_running".to_string(),
            vec![json!({"metric": {"job": "vllm"}, "values": [[1700000000, "1"], [1700000015, "2"]]})],
        );
        fake
    }

    fn queries() -> Vec<MetricQuery> {
        vec![
            MetricQuery::new("vllm_num_requests_running", "Number of running requests"),
            MetricQuery::new("vllm_gpu_cache_usage_perc", "GPU cache usage percentage"),
        ]
    }

    fn request(kind: ExportKind, format: ExportFormat) -> ExportRequest {
        ExportRequest {
            kind,
            format,
            ..ExportRequest::default()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_003_600, 0).unwrap()
    }

    #[tokio::test]
    async fn instant_document_has_one_entry_per_query() {
        let doc = collect(&healthy_collector(), "http://mel2013:9090", &queries(), &request(ExportKind::Instant, ExportFormat::Json), now())
            .await
            .unwrap();
        assert_eq!(doc.metrics.len(), 2);
        assert!(doc.time_range.is_none());
        assert!(doc.range_metrics.is_none());

        let running = &doc.metrics["vllm_num_requests_running"];
        assert_eq!(running.result_type, "vector");
        assert_eq!(running.values.len(), 1);
        assert!(running.error.is_none());

        let empty = &doc.metrics["vllm_gpu_cache_usage_perc"];
        assert_eq!(empty.result_type, "vector");
        assert_eq!(empty.error.as_deref(), Some(NO_DATA));
    }

    #[tokio::test]
    async fn json_round_trips_with_result_types() {
        let doc = collect(&healthy_collector(), "http://mel2013:9090", &queries(), &request(ExportKind::Instant, ExportFormat::Json), now())
            .await
            .unwrap();
        let bytes = render(&doc, ExportFormat::Json).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        let metrics = parsed["metrics"].as_object().unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.values().all(|m| m["result_type"].is_string()));
        assert_eq!(parsed["collector_url"], "http://mel2013:9090");
        assert_eq!(parsed["exported_at"], "2023-11-14T23:13:20Z");
    }

    #[tokio::test]
    async fn all_export_carries_both_sections() {
        let doc = collect(&healthy_collector(), "http://mel2013:9090", &queries(), &request(ExportKind::All, ExportFormat::Json), now())
            .await
            .unwrap();
        let range = doc.range_metrics.as_ref().unwrap();
        assert_eq!(range["vllm_num_requests_running"].result_type, "matrix");
        let window = doc.time_range.unwrap();
        assert_eq!(window.start, "2023-11-14T22:13:20Z");
        assert_eq!(window.end, "2023-11-14T23:13:20Z");
        assert_eq!(window.step, "15s");
    }

    #[tokio::test]
    async fn rejected_query_is_recorded_not_fatal() {
        let mut fake = healthy_collector();
        fake.rejected.push("vllm_gpu_cache_usage_perc".to_string());
        let doc = collect(&fake, "http://x:9090", &queries(), &request(ExportKind::Range, ExportFormat::Json), now())
            .await
            .unwrap();
        let failed = &doc.metrics["vllm_gpu_cache_usage_perc"];
        assert_eq!(failed.result_type, "matrix");
        assert!(failed.error.as_deref().unwrap().contains("parse error"));
    }

    #[tokio::test]
    async fn unreachable_collector_fails_the_export() {
        let fake = FakeCollector {
            down: true,
            ..FakeCollector::default()
        };
        let err = collect(&fake, "http://x:9090", &queries(), &request(ExportKind::Instant, ExportFormat::Json), now())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::CollectorUnreachable { .. }));
    }

    #[test]
    fn window_defaults_and_validation() {
        let (start, end) = TimeWindow::default().resolve(now()).unwrap();
        assert_eq!(end, now());
        assert_eq!((end - start).num_seconds(), 3600);

        let backwards = TimeWindow {
            start: Some(now()),
            end: Some(now() - chrono::Duration::minutes(5)),
            ..TimeWindow::default()
        };
        assert!(matches!(backwards.resolve(now()), Err(MonitorError::Invalid(_))));

        let too_fine = TimeWindow {
            step: Duration::from_micros(500),
            ..TimeWindow::default()
        };
        assert!(matches!(too_fine.resolve(now()), Err(MonitorError::Invalid(_))));
    }

    #[tokio::test]
    async fn sub_second_steps_are_kept() {
        let mut req = request(ExportKind::Range, ExportFormat::Json);
        req.window.step = Duration::from_millis(500);
        let doc = collect(&healthy_collector(), "http://mel2013:9090", &queries(), &req, now())
            .await
            .unwrap();
        assert_eq!(doc.time_range.unwrap().step, "500ms");
        assert_eq!(step_param(Duration::from_secs(30)), "30s");
        assert_eq!(step_param(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn concurrent_writes_to_one_path_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let writers: Vec<_> = (0..8u8)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || write_atomic(&path, &[b'a' + n; 64]))
            })
            .collect();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 64);
        assert!(written.iter().all(|b| *b == written[0]));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn csv_rows_per_sample_and_point() {
        let doc = collect(&healthy_collector(), "http://mel2013:9090", &queries(), &request(ExportKind::All, ExportFormat::Csv), now())
            .await
            .unwrap();
        let csv = render_csv(&doc);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        // Instant: one error row, one sample. Range: one error row, two points.
        assert_eq!(lines.len(), 1 + 2 + 3);
        assert!(lines.contains(&"vllm_gpu_cache_usage_perc,GPU cache usage percentage,,ERROR,"));
        let sample = lines
            .iter()
            .find(|l| l.ends_with("2023-11-14T22:13:20.500Z"))
            .unwrap();
        assert!(sample.contains(r#""{""instance"":""mel2013:8000"",""job"":""vllm""}""#));
        assert!(sample.contains(",3,"));
    }

    #[test]
    fn kind_and_format_parse() {
        assert_eq!("range".parse::<ExportKind>().unwrap(), ExportKind::Range);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
