// ABOUTME: Egress policy proxy for Stratus microVMs
// ABOUTME: Resolves the owning VM per connection, applies its firewall, logs, and forwards

pub mod ca;
pub mod error;
pub mod firewall;
pub mod netlog;
pub mod registry;
pub mod server;

pub use ca::CertificateAuthority;
pub use error::{ProxyError, Result};
pub use firewall::{evaluate, evaluate_resolved, FirewallDecision};
pub use netlog::{append_record, network_log_path, read_records, NetworkLogRecord};
pub use registry::{ProxyVmEntry, ProxyVmRegistry};
pub use server::{default_upstream_tls, start_proxy, ProxyServer, RunningProxy};
