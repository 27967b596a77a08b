// ABOUTME: Per-run network log of proxied egress connections
// ABOUTME: Append-only JSON lines, one record per connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use stratus_core::constants::NETWORK_LOG_DIR;
use stratus_core::FirewallAction;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLogRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub vm_id: String,
    pub source_ip: IpAddr,
    /// `CONNECT` for tunnels, the HTTP method for plain requests
    pub method: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub action: FirewallAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(default)]
    pub tls_intercepted: bool,
    /// Inner request line seen after TLS interception
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_path: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Log file for `run_id` under `temp_dir`
pub fn network_log_path(temp_dir: &Path, run_id: &str) -> PathBuf {
    let safe: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    temp_dir
        .join(NETWORK_LOG_DIR)
        .join(format!("{}.jsonl", safe))
}

/// Append one record as a single line
pub async fn append_record(path: &Path, record: &NetworkLogRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    // One write per record so concurrent appenders never interleave within a line
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

/// Read every record in a log file. A missing file is an empty log.
pub async fn read_records(path: &Path) -> Result<Vec<NetworkLogRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}
