//! Deployment units and their batch scripts.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use ubench_core::config::{ContainerSettings, SlurmSettings};
use ubench_core::{ClientRecipe, ResourceRequest, ServerRecipe};
use ubench_state::InstanceKind;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Everything needed to turn a recipe into one batch job.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentUnit {
    pub recipe_name: String,
    pub service_name: String,
    pub kind: InstanceKind,
    /// Shell lines run before `command` (module loads, image pulls).
    pub setup: Vec<String>,
    pub command: String,
    pub ports: Vec<u16>,
    pub resources: ResourceRequest,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    /// Seeded into the instance's metadata on submission.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DeploymentUnit {
    pub fn new(
        kind: InstanceKind,
        recipe_name: impl Into<String>,
        service_name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            recipe_name: recipe_name.into(),
            service_name: service_name.into(),
            kind,
            setup: Vec::new(),
            command: command.into(),
            ports: Vec::new(),
            resources: ResourceRequest::default(),
            env: BTreeMap::new(),
            working_dir: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A server recipe. With `service.image` set, the command runs inside
    /// the container, with GPU passthrough when GPUs are requested.
    pub fn for_server(recipe: &ServerRecipe, containers: &ContainerSettings) -> Self {
        let mut unit = Self::new(
            InstanceKind::Server,
            &recipe.name,
            recipe.service_name(),
            &recipe.service.command,
        );
        if let Some(image) = &recipe.service.image {
            unit.setup = module_lines(containers);
            let nv = if recipe.resources.gpu_count > 0 { " --nv" } else { "" };
            unit.command = format!(
                "apptainer exec{nv} {} {}",
                shell_quote(image),
                recipe.service.command
            );
        }
        unit.ports = recipe.service.ports.clone();
        unit.resources = recipe.resources.clone();
        unit.env = recipe.env.clone();
        unit.working_dir = recipe.service.working_dir.clone();
        unit
    }

    /// A benchmark client aimed at `target_url`.
    ///
    /// The workload parameters reach the client command as `UBENCH_*`
    /// environment variables, with the request body and headers as JSON in
    /// `UBENCH_PAYLOAD` and `UBENCH_HEADERS` (`{}` when unset). Recipe `env`
    /// entries win on conflict.
    pub fn for_client(recipe: &ClientRecipe, target_url: &str) -> OrchestratorResult<Self> {
        let mut unit = Self::new(
            InstanceKind::Client,
            &recipe.name,
            recipe.service_name(),
            &recipe.workload.command,
        );
        let w = &recipe.workload;
        let payload = recipe.request_payload().unwrap_or_default();
        let mut env = BTreeMap::from([
            ("UBENCH_TARGET_URL".to_string(), target_url.to_string()),
            ("UBENCH_WORKLOAD_PATTERN".to_string(), w.pattern.as_str().to_string()),
            ("UBENCH_DURATION_SECONDS".to_string(), w.duration_seconds.to_string()),
            ("UBENCH_CONCURRENT_USERS".to_string(), w.concurrent_users.to_string()),
            ("UBENCH_REQUESTS_PER_USER".to_string(), w.requests_per_user.to_string()),
            ("UBENCH_THINK_TIME_MS".to_string(), w.think_time_ms.to_string()),
            ("UBENCH_PAYLOAD".to_string(), to_json(&recipe.name, "payload", &payload)?),
            ("UBENCH_HEADERS".to_string(), to_json(&recipe.name, "headers", &recipe.headers)?),
        ]);
        if let Some(dest) = &recipe.output.destination {
            env.insert("UBENCH_OUTPUT_DIR".to_string(), dest.clone());
        }
        if let Some(dataset) = &recipe.dataset {
            env.insert("UBENCH_DATASET_TYPE".to_string(), dataset.kind.clone());
        }
        env.extend(recipe.env.clone());
        unit.env = env;
        unit.resources = recipe.resources.clone();
        unit.metadata
            .insert("target_url".to_string(), target_url.into());
        Ok(unit)
    }

    /// SLURM job name, e.g. `ubench-server-vllm`.
    pub fn job_name(&self) -> String {
        format!("ubench-{}-{}", self.kind, self.recipe_name)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.command.trim().is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "{} has no command to run",
                self.recipe_name
            )));
        }
        if self.kind == InstanceKind::Server && self.ports.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "server {} declares no ports",
                self.recipe_name
            )));
        }
        if let Some(key) = self.env.keys().find(|k| !is_env_name(k)) {
            return Err(OrchestratorError::Validation(format!(
                "{}: '{key}' is not a valid environment variable name",
                self.recipe_name
            )));
        }
        Ok(())
    }
}

/// `module load` lines for container support, if configured.
pub fn module_lines(containers: &ContainerSettings) -> Vec<String> {
    [&containers.module_env, &containers.apptainer_module]
        .into_iter()
        .flatten()
        .map(|m| format!("module load {}", shell_quote(m)))
        .collect()
}

/// Per-submission values that are not part of the unit.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub slurm: &'a SlurmSettings,
    pub log_dir: &'a Path,
    pub instance_id: &'a str,
}

/// Render a complete SLURM batch script for `unit`.
pub fn render_batch_script(unit: &DeploymentUnit, ctx: &ScriptContext<'_>) -> String {
    let res = &unit.resources;
    let job_name = unit.job_name();
    let partition = res.partition.as_deref().unwrap_or(&ctx.slurm.partition);
    let time_limit = res.time_limit.as_deref().unwrap_or(&ctx.slurm.time_limit);
    let log_prefix = ctx.log_dir.join(&job_name);

    let mut s = String::new();
    s.push_str("#!/bin/bash -l\n");
    let _ = writeln!(s, "#SBATCH --job-name={job_name}");
    let _ = writeln!(s, "#SBATCH --partition={partition}");
    let _ = writeln!(s, "#SBATCH --qos={}", ctx.slurm.qos);
    if let Some(account) = &ctx.slurm.account {
        let _ = writeln!(s, "#SBATCH --account={account}");
    }
    let _ = writeln!(s, "#SBATCH --time={time_limit}");
    s.push_str("#SBATCH --nodes=1\n#SBATCH --ntasks=1\n");
    let _ = writeln!(s, "#SBATCH --cpus-per-task={}", res.cpu_cores);
    let _ = writeln!(s, "#SBATCH --mem={}G", res.memory_gb);
    if res.gpu_count > 0 {
        let _ = writeln!(s, "#SBATCH --gres=gpu:{}", res.gpu_count);
    }
    let _ = writeln!(s, "#SBATCH --output={}-%j.out", log_prefix.display());
    let _ = writeln!(s, "#SBATCH --error={}-%j.err", log_prefix.display());
    s.push('\n');

    // Lmod init scripts read unset variables, so `-u` comes after them.
    s.push_str("set -eo pipefail\n\n");
    for line in &unit.setup {
        s.push_str(line);
        s.push('\n');
    }
    s.push_str("set -u\n\n");

    let _ = writeln!(s, "export UBENCH_INSTANCE_ID={}", shell_quote(ctx.instance_id));
    let _ = writeln!(s, "export UBENCH_SERVICE_NAME={}", shell_quote(&unit.service_name));
    for (key, value) in &unit.env {
        let _ = writeln!(s, "export {key}={}", shell_quote(value));
    }
    if let Some(dir) = &unit.working_dir {
        let _ = writeln!(s, "cd {}", shell_quote(dir));
    }
    s.push('\n');
    let _ = writeln!(
        s,
        "echo \"ubench: {job_name} on $(hostname) as job ${{SLURM_JOB_ID:-?}}\""
    );
    s.push_str(&unit.command);
    s.push('\n');
    s
}

/// Single-quote `value` for bash.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn to_json<T: serde::Serialize>(recipe: &str, what: &str, value: &T) -> OrchestratorResult<String> {
    serde_json::to_string(value).map_err(|e| {
        OrchestratorError::Validation(format!("{recipe}: {what} cannot be encoded as JSON: {e}"))
    })
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
