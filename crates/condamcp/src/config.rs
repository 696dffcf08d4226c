use crate::cli::Args;
use anyhow::Context;
use engine::builder::Patterns;
use engine::locate::Discovery;
use engine::{EngineConfig, JobLimits, RunnerLimits, TimeoutPolicy};
use protocol::config::ServerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct Settings {
    pub(crate) engine: EngineConfig,
    pub(crate) reap_interval: Duration,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) log_to_file: bool,
    pub(crate) conda_found: bool,
}

pub(crate) fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ServerConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

/// Merges file values with CLI overrides and validates the result.
pub(crate) fn resolve_settings(
    config: ServerConfig,
    args: &Args,
    discovery: Discovery,
) -> anyhow::Result<Settings> {
    let defaults = TimeoutPolicy::default();
    let timeouts = TimeoutPolicy {
        query: duration_or("timeouts.query", config.timeouts.query.as_deref(), defaults.query)?,
        long: duration_or("timeouts.long", config.timeouts.long.as_deref(), defaults.long)?,
        max: duration_or("timeouts.max", config.timeouts.max.as_deref(), defaults.max)?,
    };
    if timeouts.query > timeouts.max {
        anyhow::bail!("timeouts.query must not exceed timeouts.max");
    }
    if timeouts.long > timeouts.max {
        anyhow::bail!("timeouts.long must not exceed timeouts.max");
    }

    let runner_defaults = RunnerLimits::default();
    let runner = RunnerLimits {
        grace: duration_or("timeouts.grace", config.timeouts.grace.as_deref(), runner_defaults.grace)?,
        max_output_bytes: byte_limit(
            "limits.max_output_bytes",
            config.limits.max_output_bytes,
            runner_defaults.max_output_bytes,
        )?,
        max_structured_bytes: byte_limit(
            "limits.max_structured_bytes",
            config.limits.max_structured_bytes,
            runner_defaults.max_structured_bytes,
        )?,
        max_log_bytes: byte_limit(
            "limits.max_log_bytes",
            config.limits.max_log_bytes,
            runner_defaults.max_log_bytes,
        )?,
    };
    if runner.max_structured_bytes < runner.max_output_bytes {
        anyhow::bail!("limits.max_structured_bytes must not be smaller than limits.max_output_bytes");
    }

    let job_defaults = JobLimits::default();
    let jobs = JobLimits {
        max_running: config.jobs.max_running.unwrap_or(job_defaults.max_running),
        max_retained: config.jobs.max_retained.unwrap_or(job_defaults.max_retained),
        retention: duration_or("jobs.retention", config.jobs.retention.as_deref(), job_defaults.retention)?,
    };
    if jobs.max_running == 0 {
        anyhow::bail!("jobs.max_running must be at least 1");
    }
    if jobs.max_retained == 0 {
        anyhow::bail!("jobs.max_retained must be at least 1");
    }
    let reap_interval = duration_or(
        "jobs.reap_interval",
        config.jobs.reap_interval.as_deref(),
        DEFAULT_REAP_INTERVAL,
    )?;

    let build_env = args.build_env.clone().or(config.build_env);
    if let Some(name) = build_env.as_deref() {
        Patterns::compile()?
            .check_env_name("build_env", name)
            .context("invalid build_env")?;
    }

    let log_dir = match args.log_dir.as_deref() {
        Some(dir) => Some(expand_tilde(dir)),
        None => config
            .log_dir
            .as_deref()
            .map(|dir| expand_tilde(&dir.to_string_lossy())),
    };
    if args.log_to_file && log_dir.is_none() {
        anyhow::bail!("--log-to-file needs --log-dir or log_dir in the config");
    }

    let explicit = args
        .conda
        .clone()
        .or(config.conda)
        .map(|path| expand_tilde(&path.to_string_lossy()));
    let located = Discovery {
        explicit,
        ..discovery
    }
    .locate();
    let conda_found = located.is_some();

    let mut engine = EngineConfig::new(located.unwrap_or_else(|| PathBuf::from("conda")));
    engine.build_env = build_env;
    engine.timeouts = timeouts;
    engine.runner = runner;
    engine.jobs = jobs;
    engine.record_dir = log_dir.as_ref().map(|dir| dir.join("jobs"));

    Ok(Settings {
        engine,
        reap_interval,
        log_dir,
        log_to_file: args.log_to_file,
        conda_found,
    })
}

fn duration_or(name: &str, raw: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value = humantime::parse_duration(raw)
        .with_context(|| format!("invalid duration for {name}: {raw:?}"))?;
    if value.is_zero() {
        anyhow::bail!("{name} must be greater than zero");
    }
    Ok(value)
}

fn byte_limit(name: &str, raw: Option<u64>, default: usize) -> anyhow::Result<usize> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    if raw == 0 {
        anyhow::bail!("{name} must be greater than zero");
    }
    usize::try_from(raw).with_context(|| format!("{name} is too large"))
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
