use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "condamcp",
    version,
    about = "MCP stdio server for the conda package manager"
)]
pub(crate) struct Args {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Path to the conda executable; discovered from the environment otherwise.
    #[arg(long)]
    pub(crate) conda: Option<PathBuf>,
    /// Environment that provides conda-build.
    #[arg(long)]
    pub(crate) build_env: Option<String>,
    /// Directory for job result records and the JSON log file.
    #[arg(long)]
    pub(crate) log_dir: Option<String>,
    /// Also write a daily-rotated JSON log into the log directory.
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_file: bool,
}
