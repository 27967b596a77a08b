// ABOUTME: Host side of the vsock channel to the in-guest agent
// ABOUTME: Length-prefixed JSON frames: one job request in, streamed events and one terminal result out

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use stratus_core::{CliAgentType, ExecutionContext, ResumeSession};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::{Result, SandboxError};

/// Largest frame either side may send
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const HANDSHAKE_LINE_MAX: usize = 64;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the guest agent needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub run_id: String,
    pub prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub resume_session: Option<ResumeSession>,
    pub cli_agent_type: CliAgentType,
    /// Explicit proxy for all outbound traffic
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// CA the guest must trust when the proxy inspects TLS
    #[serde(default)]
    pub ca_cert_pem: Option<String>,
    pub timeout_secs: u64,
}

impl JobRequest {
    pub fn from_context(
        ctx: &ExecutionContext,
        proxy_url: Option<String>,
        ca_cert_pem: Option<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            prompt: ctx.prompt.clone(),
            working_dir: ctx.working_dir.clone(),
            environment: ctx.environment.clone(),
            secrets: ctx.secret_values.clone(),
            vars: ctx.vars.clone(),
            resume_session: ctx.resume_session.clone(),
            cli_agent_type: ctx.cli_agent_type,
            proxy_url,
            ca_cert_pem,
            timeout_secs,
        }
    }
}

/// Frames sent by the guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    /// Streamed agent output; any number, in order
    Event { event: serde_json::Value },
    Completed {
        exit_code: i32,
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    Failed { error: String },
}

impl GuestMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Event { .. })
    }
}

/// Write one `u32` big-endian length followed by the JSON body.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(SandboxError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` means the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SandboxError::GuestChannel(
                "Connection closed inside a frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(SandboxError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        SandboxError::GuestChannel(format!("Truncated frame of {} bytes: {}", len, e))
    })?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Connected, handshaken channel to one guest
#[derive(Debug)]
pub struct GuestChannel {
    stream: UnixStream,
}

impl GuestChannel {
    /// Connect through the hypervisor's vsock socket, retrying until the guest agent
    /// accepts or `ready_timeout` elapses.
    pub async fn connect(vsock_path: &Path, port: u32, ready_timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SandboxError::BootTimeout {
                    what: "guest channel",
                    seconds: ready_timeout.as_secs(),
                });
            }

            match timeout(remaining, Self::connect_once(vsock_path, port)).await {
                Ok(Ok(stream)) => return Ok(Self { stream }),
                Ok(Err(e)) => debug!("Guest not ready on {}: {}", vsock_path.display(), e),
                Err(_) => continue,
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL.min(remaining)).await;
        }
    }

    async fn connect_once(vsock_path: &Path, port: u32) -> Result<UnixStream> {
        let mut stream = UnixStream::connect(vsock_path).await?;
        stream
            .write_all(format!("CONNECT {}\n", port).as_bytes())
            .await?;

        // Reply is a single line; anything after it belongs to the guest
        let mut line = Vec::with_capacity(HANDSHAKE_LINE_MAX);
        loop {
            let byte = stream.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() >= HANDSHAKE_LINE_MAX {
                return Err(SandboxError::GuestChannel(
                    "Handshake reply too long".to_string(),
                ));
            }
        }

        let reply = String::from_utf8_lossy(&line);
        if reply.starts_with("OK") {
            Ok(stream)
        } else {
            Err(SandboxError::GuestChannel(format!(
                "Handshake rejected: {}",
                reply.trim()
            )))
        }
    }

    pub async fn send_job(&mut self, request: &JobRequest) -> Result<()> {
        write_frame(&mut self.stream, request).await
    }

    /// Next guest message, or `None` if the guest hung up.
    pub async fn next_message(&mut self) -> Result<Option<GuestMessage>> {
        read_frame(&mut self.stream).await
    }
}
