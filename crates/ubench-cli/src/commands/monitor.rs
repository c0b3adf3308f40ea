//! `ubench monitor ...`: collectors in front of deployed services, and
//! metric exports from them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use tracing::{info, warn};

use ubench_core::{RecipeKind, parse_duration};
use ubench_monitor::{
    ExportFormat, ExportKind, ExportRequest, MetricQuery, MonitorLifecycle, TimeWindow,
};
use ubench_state::InstanceKind;

use super::common;
use crate::context::Context;
use crate::exit::UsageError;
use crate::output;

#[derive(Debug, Subcommand)]
pub enum MonitorCommand {
    /// Resolve targets and deploy a collector for a monitor recipe.
    #[command(visible_alias = "run")]
    Start {
        recipe: String,
        /// Pin targets to scheduler jobs, in declaration order.
        #[arg(long = "job")]
        jobs: Vec<String>,
    },
    /// List available monitor recipes.
    List,
    /// Show monitor instances, refreshed from the scheduler.
    Status {
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show stored monitor instances without asking the scheduler.
    Instances,
    /// Cancel one monitor.
    Stop { id: String },
    /// Cancel every active monitor.
    StopAll,
    /// Show a monitor recipe.
    Info { recipe: String },
    /// Write a starter monitor recipe.
    Template { name: String },
    /// Forget stopped and failed monitors.
    Prune,
    /// Re-resolve a monitor's targets and reload its collector.
    Refresh {
        id: String,
        #[arg(long = "job")]
        jobs: Vec<String>,
    },
    /// Export metrics from one running monitor.
    Export {
        id: String,
        /// Output file (default: a timestamped file in the export directory).
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        args: ExportArgs,
    },
    /// Export metrics from every running monitor.
    ExportAll {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Repeat the export at this interval until interrupted (e.g. 5m).
        #[arg(long, value_parser = parse_interval)]
        interval: Option<Duration>,
        #[command(flatten)]
        args: ExportArgs,
    },
}

/// What to query and how to write it.
#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    /// instant, range or all.
    #[arg(long = "type", default_value = "instant")]
    pub kind: ExportKind,
    /// json or csv.
    #[arg(long, default_value = "json")]
    pub format: ExportFormat,
    /// Range start: RFC 3339 time, or a duration back from now (e.g. 2h).
    #[arg(long, value_parser = parse_time_arg)]
    pub start: Option<TimeArg>,
    /// Range end: RFC 3339 time, or a duration back from now.
    #[arg(long, value_parser = parse_time_arg)]
    pub end: Option<TimeArg>,
    /// Range resolution.
    #[arg(long, default_value = "15s", value_parser = parse_interval)]
    pub step: Duration,
    /// Custom queries as `expr[:description],...`, replacing the default set.
    #[arg(long)]
    pub queries: Option<String>,
}

/// A point in time given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeArg {
    At(DateTime<Utc>),
    Ago(Duration),
}

impl TimeArg {
    fn at(self, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        match self {
            TimeArg::At(t) => Ok(t),
            TimeArg::Ago(d) => Ok(now - chrono::Duration::from_std(d)?),
        }
    }
}

fn parse_time_arg(s: &str) -> Result<TimeArg, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(TimeArg::At(t.with_timezone(&Utc)));
    }
    parse_duration(s)
        .map(TimeArg::Ago)
        .ok_or_else(|| format!("'{s}' is neither an RFC 3339 time nor a duration like 30m"))
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    match parse_duration(s) {
        Some(d) if !d.is_zero() => Ok(d),
        Some(_) => Err("must be greater than zero".to_string()),
        None => Err(format!("invalid duration '{s}' (expected e.g. 15s, 5m, 1h)")),
    }
}

impl ExportArgs {
    /// Relative bounds are resolved against `now`, so periodic exports
    /// slide their window.
    fn request(&self, output: Option<PathBuf>, now: DateTime<Utc>) -> anyhow::Result<ExportRequest> {
        if self.kind == ExportKind::Instant && (self.start.is_some() || self.end.is_some()) {
            anyhow::bail!(UsageError(
                "--start and --end need --type range or --type all".to_string()
            ));
        }
        let queries = self
            .queries
            .as_deref()
            .map(MetricQuery::parse_list)
            .filter(|q| !q.is_empty());
        Ok(ExportRequest {
            kind: self.kind,
            format: self.format,
            output,
            queries,
            window: TimeWindow {
                start: self.start.map(|t| t.at(now)).transpose()?,
                end: self.end.map(|t| t.at(now)).transpose()?,
                step: self.step,
            },
        })
    }
}

pub async fn run(ctx: &Context, command: MonitorCommand) -> anyhow::Result<()> {
    const KIND: InstanceKind = InstanceKind::Collector;
    match command {
        MonitorCommand::Start { recipe, jobs } => {
            let instance = ctx.lifecycle()?.start(&recipe, &jobs).await?;
            output::print_instance(&instance);
            Ok(())
        }
        MonitorCommand::List => common::list_recipes(ctx, RecipeKind::Monitor),
        MonitorCommand::Status { id, json } => {
            let lifecycle = ctx.lifecycle()?;
            match id {
                Some(id) => {
                    let instance = lifecycle.status(&id).await?;
                    if json {
                        output::print_json(&instance)
                    } else {
                        output::print_instance(&instance);
                        Ok(())
                    }
                }
                None => {
                    let instances = lifecycle.list().await?;
                    if json {
                        output::print_json(&instances)
                    } else {
                        output::print_instances(&instances);
                        Ok(())
                    }
                }
            }
        }
        MonitorCommand::Instances => common::list(ctx, KIND),
        MonitorCommand::Stop { id } => common::stop(ctx, KIND, &id).await,
        MonitorCommand::StopAll => common::stop_all(ctx, KIND).await,
        MonitorCommand::Info { recipe } => common::recipe_info(ctx, RecipeKind::Monitor, &recipe),
        MonitorCommand::Template { name } => common::template(ctx, RecipeKind::Monitor, &name),
        MonitorCommand::Prune => common::prune(ctx, KIND),
        MonitorCommand::Refresh { id, jobs } => {
            let targets = ctx.lifecycle()?.refresh_targets(&id, &jobs).await?;
            for t in &targets {
                println!("{:<20}  {}{}", t.name, t.address, t.metrics_path);
            }
            Ok(())
        }
        MonitorCommand::Export { id, output, args } => {
            let request = args.request(output, Utc::now())?;
            let path = ctx.lifecycle()?.export_metrics(&id, &request).await?;
            println!("Exported metrics to {}", path.display());
            Ok(())
        }
        MonitorCommand::ExportAll {
            output_dir,
            interval,
            args,
        } => {
            let lifecycle = ctx.lifecycle()?;
            let Some(interval) = interval else {
                return export_all_once(&lifecycle, &args, output_dir.as_deref()).await;
            };
            let mut interrupted = ctx.interrupted();
            info!(interval_secs = interval.as_secs(), "periodic export started, Ctrl-C to stop");
            loop {
                // One bad round does not end a periodic export.
                if let Err(e) = export_all_once(&lifecycle, &args, output_dir.as_deref()).await {
                    warn!(error = %format!("{e:#}"), "export round failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = interrupted.wait_for(|stop| *stop) => {
                        info!("periodic export stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn export_all_once(
    lifecycle: &MonitorLifecycle,
    args: &ExportArgs,
    dir: Option<&Path>,
) -> anyhow::Result<()> {
    let request = args.request(None, Utc::now())?;
    let results = lifecycle.export_all_running(&request, dir).await?;
    if results.is_empty() {
        println!("No running monitors.");
        return Ok(());
    }
    let mut failed = 0usize;
    for (id, result) in &results {
        match result {
            Ok(path) => println!("{}  {}", output::short_id(id), path.display()),
            Err(e) => {
                failed += 1;
                println!("{}  failed: {e}", output::short_id(id));
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} exports failed", results.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_args_accept_rfc3339_and_relative() {
        let at = parse_time_arg("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(
            at,
            TimeArg::At(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_time_arg("2h").unwrap(),
            TimeArg::Ago(Duration::from_secs(7200))
        );
        assert!(parse_time_arg("yesterday").is_err());
    }

    #[test]
    fn intervals_must_be_positive() {
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn relative_bounds_resolve_against_now() {
        let args = ExportArgs {
            kind: ExportKind::Range,
            format: ExportFormat::Csv,
            start: Some(TimeArg::Ago(Duration::from_secs(1800))),
            end: None,
            step: Duration::from_secs(30),
            queries: Some("up:Target health, ".to_string()),
        };
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let request = args.request(None, now).unwrap();
        assert_eq!(request.kind, ExportKind::Range);
        assert_eq!(request.window.start, Some(Utc.timestamp_opt(1_699_998_200, 0).unwrap()));
        assert_eq!(request.window.end, None);
        assert_eq!(request.window.step, Duration::from_secs(30));
        assert_eq!(
            request.queries,
            Some(vec![MetricQuery::new("up", "Target health")])
        );
    }

    #[test]
    fn time_bounds_on_an_instant_export_are_a_usage_error() {
        let args = ExportArgs {
            kind: ExportKind::Instant,
            format: ExportFormat::Json,
            start: Some(TimeArg::Ago(Duration::from_secs(600))),
            end: None,
            step: Duration::from_secs(15),
            queries: None,
        };
        let err = args.request(None, Utc::now()).unwrap_err();
        assert!(err.is::<UsageError>());
        assert_eq!(crate::exit::exit_code(&err), crate::exit::VALIDATION);
    }

    #[test]
    fn empty_query_list_keeps_defaults() {
        let args = ExportArgs {
            kind: ExportKind::Instant,
            format: ExportFormat::Json,
            start: None,
            end: None,
            step: Duration::from_secs(15),
            queries: Some(" , ".to_string()),
        };
        let request = args.request(None, Utc::now()).unwrap();
        assert!(request.queries.is_none());
    }
}
