// ABOUTME: Configuration and environment variable management for Stratus
// ABOUTME: Exposes env var names plus typed readers shared by the runner and control plane

pub mod constants;
pub mod env;

pub use env::{env_bool, env_parse, env_string, env_u64_in_range};
