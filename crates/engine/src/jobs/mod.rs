mod monitor;
mod registry;

pub use registry::{JobLimits, JobRegistry};
