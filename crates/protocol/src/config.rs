use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub conda: Option<PathBuf>,
    pub build_env: Option<String>,
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Durations are humantime strings such as `"90s"` or `"1h 30m"`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub query: Option<String>,
    pub long: Option<String>,
    pub max: Option<String>,
    pub grace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_output_bytes: Option<u64>,
    pub max_structured_bytes: Option<u64>,
    pub max_log_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    pub max_running: Option<usize>,
    pub max_retained: Option<usize>,
    pub retention: Option<String>,
    pub reap_interval: Option<String>,
}
