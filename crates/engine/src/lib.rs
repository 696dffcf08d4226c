pub mod builder;
pub mod error;
pub mod facade;
pub mod jobs;
pub mod locate;
pub mod parser;
mod record;
pub mod runner;
pub mod sysinfo;

#[cfg(test)]
mod test_utils;

pub use builder::{CommandBuilder, CommandDescriptor, TimeoutPolicy};
pub use error::{EngineError, Result};
pub use facade::{Engine, EngineConfig};
pub use jobs::{JobLimits, JobRegistry};
pub use runner::{ProcessRunner, RunnerLimits};
