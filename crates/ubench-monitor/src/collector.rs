//! The metrics collector: its configuration, its batch job, and its API.
//!
//! The collector is Prometheus run through Apptainer. Its configuration is
//! written as JSON, which Prometheus accepts as YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ubench_core::config::ContainerSettings;
use ubench_core::{CollectorSpec, MonitorRecipe};
use ubench_scheduler::BoxFuture;
use ubench_scheduler::script::{DeploymentUnit, module_lines, shell_quote};
use ubench_state::{InstanceKind, META_COLLECTOR_PORT, META_SERVICE_KIND, META_TARGETS};

use crate::error::{MonitorError, MonitorResult};
use crate::targets::Target;

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PrometheusConfig<'a> {
    global: GlobalConfig<'a>,
    scrape_configs: Vec<ScrapeConfig<'a>>,
}

#[derive(Debug, Serialize)]
struct GlobalConfig<'a> {
    scrape_interval: &'a str,
    evaluation_interval: &'a str,
}

#[derive(Debug, Serialize)]
struct ScrapeConfig<'a> {
    job_name: &'a str,
    metrics_path: &'a str,
    scrape_interval: &'a str,
    static_configs: Vec<StaticConfig<'a>>,
}

#[derive(Debug, Serialize)]
struct StaticConfig<'a> {
    targets: Vec<&'a str>,
}

/// Render `prometheus.yml`: one scrape job per target.
pub fn render_config(spec: &CollectorSpec, targets: &[Target]) -> MonitorResult<String> {
    let interval = spec.scrape_interval.as_str();
    let config = PrometheusConfig {
        global: GlobalConfig {
            scrape_interval: interval,
            evaluation_interval: interval,
        },
        scrape_configs: targets
            .iter()
            .map(|t| ScrapeConfig {
                job_name: &t.name,
                metrics_path: &t.metrics_path,
                scrape_interval: interval,
                static_configs: vec![StaticConfig {
                    targets: vec![&t.address],
                }],
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&config)?)
}

/// Files belonging to one collector instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorLayout {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl CollectorLayout {
    /// `<monitor_dir>/config` and `<monitor_dir>/data`.
    pub fn new(monitor_dir: &Path) -> Self {
        Self {
            config_dir: monitor_dir.join("config"),
            data_dir: monitor_dir.join("data"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("prometheus.yml")
    }

    /// Write the configuration, creating both directories.
    pub fn write_config(&self, rendered: &str) -> MonitorResult<PathBuf> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.config_file();
        crate::export::write_atomic(&path, rendered.as_bytes())?;
        debug!(path = %path.display(), "collector config written");
        Ok(path)
    }
}

/// `docker://prom/prometheus:latest` → `prom_prometheus_latest.sif`.
fn image_file_name(image: &str) -> String {
    let reference = image.split_once("://").map_or(image, |(_, r)| r);
    let mut name: String = reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    name.push_str(".sif");
    name
}

/// The collector's deployment unit.
///
/// Pulls the image into `image_cache` once, binds the config and data
/// directories, and enables the lifecycle API so configuration changes can
/// be pushed with a reload.
pub fn collector_unit(
    recipe: &MonitorRecipe,
    targets: &[Target],
    layout: &CollectorLayout,
    containers: &ContainerSettings,
    image_cache: &Path,
) -> MonitorResult<DeploymentUnit> {
    let spec = &recipe.collector;
    let image_file = image_cache.join(image_file_name(&spec.image));
    let image_file = shell_quote(&image_file.to_string_lossy());
    let config_dir = shell_quote(&layout.config_dir.to_string_lossy());
    let data_dir = shell_quote(&layout.data_dir.to_string_lossy());

    let mut setup = module_lines(containers);
    setup.push(format!("mkdir -p {config_dir} {data_dir}"));
    setup.push(format!("mkdir -p {}", shell_quote(&image_cache.to_string_lossy())));
    setup.push(format!(
        "[ -f {image_file} ] || apptainer pull {image_file} {}",
        shell_quote(&spec.image)
    ));

    let command = format!(
        "apptainer exec --bind {config_dir}:/etc/prometheus --bind {data_dir}:/prometheus {image_file} \
         /bin/prometheus --config.file=/etc/prometheus/prometheus.yml --storage.tsdb.path=/prometheus \
         --storage.tsdb.retention.time={} --web.listen-address=0.0.0.0:{} --web.enable-lifecycle",
        shell_quote(&spec.retention),
        spec.port
    );

    let mut unit = DeploymentUnit::new(
        InstanceKind::Collector,
        &recipe.name,
        recipe.service_name(),
        command,
    );
    unit.setup = setup;
    unit.ports = vec![spec.port];
    unit.resources = recipe.resources.clone();
    unit.metadata
        .insert(META_TARGETS.to_string(), serde_json::to_value(targets)?);
    unit.metadata
        .insert(META_SERVICE_KIND.to_string(), recipe.service_kind().into());
    unit.metadata
        .insert(META_COLLECTOR_PORT.to_string(), spec.port.into());
    Ok(unit)
}

// ── Query API ──────────────────────────────────────────────────────

/// The `data` member of a successful Prometheus query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

/// Inclusive range query bounds, in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeBounds {
    pub start: f64,
    pub end: f64,
    pub step: Duration,
}

/// Prometheus duration for a range step: whole seconds as `15s`, anything
/// finer in milliseconds.
pub(crate) fn step_param(step: Duration) -> String {
    if step.subsec_millis() == 0 {
        format!("{}s", step.as_secs())
    } else {
        format!("{}ms", step.as_millis())
    }
}

/// Read and control access to a running collector.
///
/// Transport failures are [`MonitorError::CollectorUnreachable`]; answers
/// that arrive but carry an error are [`MonitorError::Query`].
pub trait CollectorClient: Send + Sync {
    fn instant<'a>(&'a self, base_url: &'a str, query: &'a str) -> BoxFuture<'a, MonitorResult<QueryData>>;

    fn range<'a>(
        &'a self,
        base_url: &'a str,
        query: &'a str,
        bounds: RangeBounds,
    ) -> BoxFuture<'a, MonitorResult<QueryData>>;

    /// Ask the collector to re-read its configuration file.
    fn reload<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, MonitorResult<()>>;
}

/// [`CollectorClient`] speaking the Prometheus HTTP API over plain HTTP/1.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    timeout: Duration,
}

impl Default for PrometheusClient {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl PrometheusClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn query(&self, base_url: &str, path_and_query: String, query: &str) -> MonitorResult<QueryData> {
        let (status, body) = self.request(base_url, "GET", &path_and_query).await?;
        let parsed: QueryResponse = serde_json::from_slice(&body).map_err(|e| MonitorError::Query {
            query: query.to_string(),
            message: format!("HTTP {status}: undecodable response: {e}"),
        })?;
        match (parsed.status.as_str(), parsed.data) {
            ("success", Some(data)) => Ok(data),
            _ => Err(MonitorError::Query {
                query: query.to_string(),
                message: parsed.error.unwrap_or_else(|| format!("HTTP {status}")),
            }),
        }
    }

    /// One request on a fresh connection.
    async fn request(
        &self,
        base_url: &str,
        method: &str,
        path_and_query: &str,
    ) -> MonitorResult<(http::StatusCode, Bytes)> {
        let unreachable = |reason: String| MonitorError::CollectorUnreachable {
            url: base_url.to_string(),
            reason,
        };
        let authority = authority_of(base_url).ok_or_else(|| unreachable("not an http:// URL".to_string()))?;
        let uri = format!("http://{authority}{path_and_query}");

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(authority)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| unreachable(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(path_and_query)
                .header("host", authority)
                .header("user-agent", "ubench/0.1")
                .body(Empty::<Bytes>::new())
                .map_err(|e| unreachable(e.to_string()))?;
            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| unreachable(e.to_string()))?
                .to_bytes();
            debug!(%uri, %status, bytes = body.len(), "collector responded");
            Ok::<_, MonitorError>((status, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| unreachable(format!("no answer within {}s", self.timeout.as_secs())))?
    }
}

impl CollectorClient for PrometheusClient {
    fn instant<'a>(&'a self, base_url: &'a str, query: &'a str) -> BoxFuture<'a, MonitorResult<QueryData>> {
        Box::pin(async move {
            let path = format!("/api/v1/query?query={}", percent_encode(query));
            self.query(base_url, path, query).await
        })
    }

    fn range<'a>(
        &'a self,
        base_url: &'a str,
        query: &'a str,
        bounds: RangeBounds,
    ) -> BoxFuture<'a, MonitorResult<QueryData>> {
        Box::pin(async move {
            let path = format!(
                "/api/v1/query_range?query={}&start={:.3}&end={:.3}&step={}",
                percent_encode(query),
                bounds.start,
                bounds.end,
                step_param(bounds.step)
            );
            self.query(base_url, path, query).await
        })
    }

    fn reload<'a>(&'a self, base_url: &'a str) -> BoxFuture<'a, MonitorResult<()>> {
        Box::pin(async move {
            let (status, body) = self.request(base_url, "POST", "/-/reload").await?;
            if status.is_success() {
                Ok(())
            } else {
                Err(MonitorError::Query {
                    query: "reload".to_string(),
                    message: format!("HTTP {status}: {}", String::from_utf8_lossy(&body).trim()),
                })
            }
        })
    }
}

/// `http://mel2013:9090/` → `mel2013:9090`.
fn authority_of(base_url: &str) -> Option<&str> {
    let rest = base_url.strip_prefix("http://")?;
    let authority = rest.split('/').next()?;
    (!authority.is_empty()).then_some(authority)
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::TargetSource;
    use ubench_core::ResourceRequest;

    fn target(name: &str, address: &str) -> Target {
        Target {
            name: name.to_string(),
            address: address.to_string(),
            metrics_path: "/metrics".to_string(),
            source: TargetSource::Endpoint,
        }
    }

    fn recipe() -> MonitorRecipe {
        MonitorRecipe {
            name: "vllm-monitor".to_string(),
            service_name: Some("vllm".to_string()),
            description: String::new(),
            service_kind: None,
            targets: vec![],
            collector: CollectorSpec::default(),
            resources: ResourceRequest::default(),
        }
    }

    #[test]
    fn config_has_one_job_per_target() {
        let rendered = render_config(
            &CollectorSpec::default(),
            &[target("vllm", "mel2013:8000"), target("node", "mel2013:9100")],
        )
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(v["global"]["scrape_interval"], "15s");
        assert_eq!(v["global"]["evaluation_interval"], "15s");
        let jobs = v["scrape_configs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["job_name"], "vllm");
        assert_eq!(jobs[0]["metrics_path"], "/metrics");
        assert_eq!(jobs[1]["static_configs"][0]["targets"][0], "mel2013:9100");
    }

    #[test]
    fn layout_writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CollectorLayout::new(&dir.path().join("monitors").join("abc"));
        let path = layout.write_config("{}").unwrap();
        assert_eq!(path, dir.path().join("monitors/abc/config/prometheus.yml"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(layout.data_dir.is_dir());
    }

    #[test]
    fn unit_runs_prometheus_with_lifecycle_api() {
        let layout = CollectorLayout::new(Path::new("/state/monitors/abc"));
        let unit = collector_unit(
            &recipe(),
            &[target("vllm", "mel2013:8000")],
            &layout,
            &ContainerSettings::default(),
            Path::new("/cache"),
        )
        .unwrap();

        assert_eq!(unit.kind, InstanceKind::Collector);
        assert_eq!(unit.service_name, "vllm");
        assert_eq!(unit.ports, vec![9090]);
        assert!(unit.command.contains("--web.enable-lifecycle"));
        assert!(unit.command.contains("--storage.tsdb.retention.time=24h"));
        assert!(unit.command.contains("--bind /state/monitors/abc/config:/etc/prometheus"));
        assert!(unit.command.contains("/cache/prom_prometheus_latest.sif"));
        assert!(unit.setup.iter().any(|l| l.contains("apptainer pull")));
        assert_eq!(unit.metadata[META_SERVICE_KIND], "vllm");
        assert_eq!(unit.metadata[META_TARGETS][0]["address"], "mel2013:8000");
        unit.validate().unwrap();
    }

    #[test]
    fn image_names() {
        assert_eq!(image_file_name("docker://prom/prometheus:latest"), "prom_prometheus_latest.sif");
        assert_eq!(image_file_name("prometheus-v2.51"), "prometheus-v2.51.sif");
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(authority_of("http://mel2013:9090"), Some("mel2013:9090"));
        assert_eq!(authority_of("http://mel2013:9090/"), Some("mel2013:9090"));
        assert_eq!(authority_of("https://mel2013:9090"), None);
        assert_eq!(authority_of("http://"), None);
    }

    #[test]
    fn percent_encoding() {
        assert_eq!(percent_encode("up"), "up");
        assert_eq!(
            percent_encode("rate(x{job=\"a b\"}[5m])"),
            "rate%28x%7Bjob%3D%22a%20b%22%7D%5B5m%5D%29"
        );
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // Bind then drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PrometheusClient::new(Duration::from_secs(2));
        let err = client
            .instant(&format!("http://{addr}"), "up")
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::CollectorUnreachable { .. }));
    }

    #[tokio::test]
    async fn instant_query_against_canned_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"job":"vllm"},"value":[1700000000.0,"1"]}]}}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            request
        });

        let client = PrometheusClient::default();
        let data = client.instant(&format!("http://{addr}"), "up").await.unwrap();
        assert_eq!(data.result_type, "vector");
        assert_eq!(data.result.len(), 1);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/query?query=up "));
    }
}
