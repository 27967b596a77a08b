// ABOUTME: Explicit HTTP proxy server that egress from every VM passes through
// ABOUTME: Handles CONNECT tunnels and absolute-form HTTP, with optional TLS interception

use chrono::Utc;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratus_core::FirewallPolicy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

use crate::ca::CertificateAuthority;
use crate::error::{ProxyError, Result};
use crate::firewall::{evaluate, evaluate_resolved, FirewallDecision};
use crate::netlog::{append_record, NetworkLogRecord};
use crate::registry::{ProxyVmEntry, ProxyVmRegistry};

/// Largest request head accepted from a client
const MAX_HEAD_BYTES: usize = 16 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream TLS client trusting the webpki root store
pub fn default_upstream_tls() -> Result<Arc<ClientConfig>> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(Arc::new(config))
}

pub struct ProxyServer {
    registry: ProxyVmRegistry,
    ca: Arc<CertificateAuthority>,
    upstream_tls: Arc<ClientConfig>,
    connect_timeout: Duration,
}

/// Handle to a proxy started with [`start_proxy`]
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub ca_cert_pem: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningProxy {
    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }
    }
}

/// Bind `listen_addr` and serve in a background task
pub async fn start_proxy(listen_addr: SocketAddr, server: ProxyServer) -> Result<RunningProxy> {
    let listener = TcpListener::bind(listen_addr).await?;
    let addr = listener.local_addr()?;
    let ca_cert_pem = server.ca.ca_cert_pem().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("Egress proxy listening on {}", addr);
    let task = tokio::spawn(Arc::new(server).serve(listener, shutdown_rx));

    Ok(RunningProxy {
        addr,
        ca_cert_pem,
        shutdown_tx,
        task,
    })
}

/// A parsed proxy request line
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProxyTarget {
    Tunnel {
        host: String,
        port: u16,
    },
    Forward {
        method: String,
        host: String,
        port: u16,
        path: String,
        version: String,
    },
}

impl ProxyTarget {
    fn host(&self) -> &str {
        match self {
            ProxyTarget::Tunnel { host, .. } | ProxyTarget::Forward { host, .. } => host,
        }
    }

    fn port(&self) -> u16 {
        match self {
            ProxyTarget::Tunnel { port, .. } | ProxyTarget::Forward { port, .. } => *port,
        }
    }
}

/// Where a permitted target may be reached, or the rule that refused it
enum Resolution {
    Permitted(Vec<SocketAddr>),
    Denied(FirewallDecision),
}

struct RequestHead {
    /// Header bytes including the blank line
    raw: Vec<u8>,
    /// Body bytes already read past the head
    leftover: Vec<u8>,
}

impl RequestHead {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Counters and findings for one connection, flushed into a log record at the end
#[derive(Default)]
struct ConnectionTrace {
    bytes_sent: u64,
    bytes_received: u64,
    tls_intercepted: bool,
    inner_method: Option<String>,
    inner_path: Option<String>,
    error: Option<String>,
}

impl ProxyServer {
    pub fn new(
        registry: ProxyVmRegistry,
        ca: Arc<CertificateAuthority>,
        upstream_tls: Arc<ClientConfig>,
    ) -> Self {
        Self {
            registry,
            ca,
            upstream_tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Accept loop; exits when `shutdown` flips to true
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                debug!("Proxy connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Proxy accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Egress proxy shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let head = match read_request_head(&mut client).await {
            Ok(head) => head,
            Err(e) => {
                let _ = write_status(&mut client, 400, "Bad Request").await;
                return Err(e);
            }
        };
        let target = match parse_request_line(&head.text()) {
            Ok(target) => target,
            Err(e) => {
                let _ = write_status(&mut client, 400, "Bad Request").await;
                return Err(e);
            }
        };

        let Some(entry) = self.registry.lookup_by_ip(peer.ip())? else {
            warn!("Refusing proxy request from unregistered source {}", peer.ip());
            write_status(&mut client, 403, "Forbidden").await?;
            return Ok(());
        };

        let mut decision = evaluate(entry.firewall.as_ref(), target.host());
        let started = Instant::now();
        let mut trace = ConnectionTrace::default();

        // Names are resolved here so address rules see where the connection really goes
        if decision.is_allowed() {
            match self.resolve_permitted(entry.firewall.as_ref(), &target).await {
                Ok(Resolution::Permitted(addrs)) => {
                    let inspect = entry
                        .firewall
                        .as_ref()
                        .map(|f| f.inspect_tls)
                        .unwrap_or(false);
                    if let Err(e) = self
                        .forward(&mut client, &target, &addrs, head, inspect, &mut trace)
                        .await
                    {
                        trace.error = Some(e.to_string());
                    }
                }
                Ok(Resolution::Denied(denied)) => decision = denied,
                Err(e) => {
                    let _ = write_error_status(&mut client, &e).await;
                    trace.error = Some(e.to_string());
                }
            }
        }

        if !decision.is_allowed() {
            info!(
                "Denied {}:{} for run {}",
                target.host(),
                target.port(),
                entry.run_id
            );
            if let Err(e) = write_status(&mut client, 403, "Forbidden").await {
                trace.error = Some(e.to_string());
            }
        }

        self.log_connection(&entry, peer.ip(), &target, &decision, started, trace)
            .await;
        Ok(())
    }

    /// Resolve the target and keep only the addresses its firewall lets us reach.
    async fn resolve_permitted(
        &self,
        policy: Option<&FirewallPolicy>,
        target: &ProxyTarget,
    ) -> Result<Resolution> {
        let host = target.host();
        let lookup = tokio::net::lookup_host((host, target.port()));
        let resolved: Vec<SocketAddr> = match tokio::time::timeout(self.connect_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => return Err(ProxyError::Resolve(format!("{}: {}", host, e))),
            Err(_) => return Err(ProxyError::UpstreamTimeout(host.to_string())),
        };

        let mut permitted = Vec::new();
        let mut refusal = None;
        for addr in resolved {
            let decision = evaluate_resolved(policy, host, addr.ip());
            if decision.is_allowed() {
                permitted.push(addr);
            } else {
                debug!("{} resolves to denied address {}", host, addr.ip());
                refusal.get_or_insert(decision);
            }
        }

        match (permitted.is_empty(), refusal) {
            (false, _) => Ok(Resolution::Permitted(permitted)),
            (true, Some(denied)) => Ok(Resolution::Denied(denied)),
            (true, None) => Err(ProxyError::Resolve(format!("{}: no addresses", host))),
        }
    }

    async fn forward(
        &self,
        client: &mut TcpStream,
        target: &ProxyTarget,
        addrs: &[SocketAddr],
        head: RequestHead,
        inspect_tls: bool,
        trace: &mut ConnectionTrace,
    ) -> Result<()> {
        let mut upstream = match self.connect_upstream(addrs).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = write_error_status(client, &e).await;
                return Err(e);
            }
        };

        match target {
            ProxyTarget::Forward { .. } => {
                let rewritten = rewrite_forward_head(&head.text(), target)?;
                upstream.write_all(rewritten.as_bytes()).await?;
                upstream.write_all(&head.leftover).await?;
                trace.bytes_sent += (rewritten.len() + head.leftover.len()) as u64;
                relay(client, &mut upstream, trace).await
            }
            ProxyTarget::Tunnel { host, .. } => {
                client
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;

                // Bytes pipelined after CONNECT mean the client did not wait for us; stay opaque
                if inspect_tls && head.leftover.is_empty() {
                    trace.tls_intercepted = true;
                    self.intercept(client, upstream, host, trace).await
                } else {
                    upstream.write_all(&head.leftover).await?;
                    trace.bytes_sent += head.leftover.len() as u64;
                    relay(client, &mut upstream, trace).await
                }
            }
        }
    }

    async fn intercept(
        &self,
        client: &mut TcpStream,
        upstream: TcpStream,
        host: &str,
        trace: &mut ConnectionTrace,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(self.ca.server_config_for(host)?);
        let mut client_tls = acceptor.accept(client).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid server name {}: {}", host, e)))?;
        let connector = TlsConnector::from(self.upstream_tls.clone());
        let mut upstream_tls = connector.connect(server_name, upstream).await?;

        let inner = read_request_head(&mut client_tls).await?;
        if let Some(line) = inner.text().lines().next() {
            let mut parts = line.split_whitespace();
            trace.inner_method = parts.next().map(str::to_string);
            trace.inner_path = parts.next().map(str::to_string);
        }

        upstream_tls.write_all(&inner.raw).await?;
        upstream_tls.write_all(&inner.leftover).await?;
        trace.bytes_sent += (inner.raw.len() + inner.leftover.len()) as u64;
        relay(&mut client_tls, &mut upstream_tls, trace).await
    }

    /// Connect to the first reachable address; every one has passed the firewall.
    async fn connect_upstream(&self, addrs: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_error = None;
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = Some(ProxyError::Io(e)),
                Err(_) => last_error = Some(ProxyError::UpstreamTimeout(addr.to_string())),
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::Resolve("no addresses".to_string())))
    }

    async fn log_connection(
        &self,
        entry: &ProxyVmEntry,
        source_ip: IpAddr,
        target: &ProxyTarget,
        decision: &FirewallDecision,
        started: Instant,
        trace: ConnectionTrace,
    ) {
        let (method, path) = match target {
            ProxyTarget::Tunnel { .. } => ("CONNECT".to_string(), None),
            ProxyTarget::Forward { method, path, .. } => (method.clone(), Some(path.clone())),
        };
        let record = NetworkLogRecord {
            timestamp: Utc::now(),
            run_id: entry.run_id.clone(),
            vm_id: entry.vm_id.clone(),
            source_ip,
            method,
            host: target.host().to_string(),
            port: target.port(),
            path,
            action: decision.action,
            matched_rule: decision.matched_rule.clone(),
            tls_intercepted: trace.tls_intercepted,
            inner_method: trace.inner_method,
            inner_path: trace.inner_path,
            bytes_sent: trace.bytes_sent,
            bytes_received: trace.bytes_received,
            duration_ms: started.elapsed().as_millis() as u64,
            error: trace.error,
        };
        if let Err(e) = append_record(&entry.network_log_path, &record).await {
            warn!(
                "Failed to append network log for run {}: {}",
                entry.run_id, e
            );
        }
    }
}

async fn relay<C, U>(client: &mut C, upstream: &mut U, trace: &mut ConnectionTrace) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (sent, received) = tokio::io::copy_bidirectional(client, upstream).await?;
    trace.bytes_sent += sent;
    trace.bytes_received += received;
    Ok(())
}

async fn read_request_head<S>(stream: &mut S) -> Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok(RequestHead { raw: buf, leftover });
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::InvalidRequest(
                "Request head too large".to_string(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::InvalidRequest(
                "Connection closed before request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_request_line(head: &str) -> Result<ProxyTarget> {
    let line = head
        .lines()
        .next()
        .ok_or_else(|| ProxyError::InvalidRequest("Empty request".to_string()))?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::InvalidRequest(format!(
            "Malformed request line: {}",
            line
        )));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, None)?;
        return Ok(ProxyTarget::Tunnel { host, port });
    }

    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("HTTP://"))
        .ok_or_else(|| {
            ProxyError::InvalidRequest(format!("Expected absolute http:// URI, got {}", target))
        })?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(authority, Some(80))?;
    Ok(ProxyTarget::Forward {
        method: method.to_string(),
        host,
        port,
        path: path.to_string(),
        version: version.to_string(),
    })
}

fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let invalid = || ProxyError::InvalidRequest(format!("Invalid authority: {}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match (port, default_port) {
        (Some(port), _) => port.parse::<u16>().map_err(|_| invalid())?,
        (None, Some(default)) => default,
        (None, None) => return Err(invalid()),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_ascii_lowercase(), port))
}

/// Origin-form request line, hop-by-hop proxy headers dropped, one request per connection
fn rewrite_forward_head(head: &str, target: &ProxyTarget) -> Result<String> {
    let ProxyTarget::Forward {
        method,
        path,
        version,
        ..
    } = target
    else {
        return Err(ProxyError::InvalidRequest(
            "Tunnel requests are not rewritten".to_string(),
        ));
    };

    let mut out = format!("{} {} {}\r\n", method, path, version);
    for line in head.split("\r\n").skip(1) {
        if line.is_empty() {
            continue;
        }
        let name = line.split(':').next().unwrap_or("").trim();
        if name.to_ascii_lowercase().starts_with("proxy-")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
        {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    Ok(out)
}

async fn write_error_status<S>(stream: &mut S, error: &ProxyError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    match error {
        ProxyError::UpstreamTimeout(_) => write_status(stream, 504, "Gateway Timeout").await,
        _ => write_status(stream, 502, "Bad Gateway").await,
    }
}

async fn write_status<S>(stream: &mut S, code: u16, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!("{} {}\n", code, reason);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
