// ABOUTME: End-to-end tests for the egress proxy over real loopback sockets
// ABOUTME: Covers forwarding, firewall denial, unknown sources, tunnels, and TLS interception

use chrono::Utc;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{FirewallAction, FirewallPolicy, FirewallRule};
use stratus_proxy::{
    network_log_path, read_records, start_proxy, CertificateAuthority, NetworkLogRecord,
    ProxyServer, ProxyVmEntry, ProxyVmRegistry, RunningProxy,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Harness {
    _dir: TempDir,
    proxy: RunningProxy,
    ca: Arc<CertificateAuthority>,
    log_path: PathBuf,
}

fn client_config_trusting(ca_der: &[u8]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(ca_der.to_vec())).unwrap();
    Arc::new(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Start a proxy with loopback registered as a VM under `firewall`.
async fn harness(firewall: Option<FirewallPolicy>, upstream_tls: Option<Arc<ClientConfig>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = ProxyVmRegistry::new(dir.path().join("registry.json"));
    let log_path = network_log_path(dir.path(), "run_test");

    registry
        .register(ProxyVmEntry {
            vm_id: "vmtest".to_string(),
            run_id: "run_test".to_string(),
            source_ip: Ipv4Addr::LOCALHOST,
            firewall,
            network_log_path: log_path.clone(),
            registered_at: Utc::now(),
        })
        .unwrap();

    let ca = Arc::new(CertificateAuthority::load_or_generate(&dir.path().join("ca")).unwrap());
    let upstream_tls = match upstream_tls {
        Some(config) => config,
        None => stratus_proxy::default_upstream_tls().unwrap(),
    };
    let server = ProxyServer::new(registry, ca.clone(), upstream_tls)
        .with_connect_timeout(Duration::from_secs(2));
    let proxy = start_proxy("127.0.0.1:0".parse().unwrap(), server)
        .await
        .unwrap();

    Harness {
        _dir: dir,
        proxy,
        ca,
        log_path,
    }
}

async fn wait_for_records(path: &Path, count: usize) -> Vec<NetworkLogRecord> {
    for _ in 0..100 {
        let records = read_records(path).await.unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} network log records in {}", count, path.display());
}

async fn read_head(stream: &mut (impl AsyncReadExt + Unpin)) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

/// Plain HTTP origin that answers one request and reports the head it saw
async fn http_origin() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let _ = tx.send(head);
    });
    (addr, rx)
}

async fn echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });
    addr
}

#[tokio::test]
async fn test_forwards_absolute_form_request() {
    let h = harness(None, None).await;
    let (origin, seen) = http_origin().await;

    let mut client = TcpStream::connect(h.proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{}/hello?x=1 HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        origin, origin
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    drop(client);

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("ok"));

    let head = seen.await.unwrap();
    assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    assert!(head.contains("Connection: close"));

    let records = wait_for_records(&h.log_path, 1).await;
    assert_eq!(records[0].method, "GET");
    assert_eq!(records[0].path.as_deref(), Some("/hello?x=1"));
    assert_eq!(records[0].action, FirewallAction::Allow);
    assert!(records[0].bytes_received > 0);

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn test_denied_destination_gets_403_and_is_logged() {
    let policy = FirewallPolicy {
        rules: vec![FirewallRule::allow("*.github.com")],
        default_action: FirewallAction::Deny,
        inspect_tls: false,
    };
    let h = harness(Some(policy), None).await;

    let mut client = TcpStream::connect(h.proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT exfil.example.com:443 HTTP/1.1\r\nHost: exfil.example.com:443\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403"));

    let records = wait_for_records(&h.log_path, 1).await;
    assert_eq!(records[0].action, FirewallAction::Deny);
    assert_eq!(records[0].host, "exfil.example.com");
    assert_eq!(records[0].method, "CONNECT");
    assert_eq!(records[0].matched_rule, None);
}

#[tokio::test]
async fn test_cidr_rules_apply_to_resolved_hostnames() {
    let policy = FirewallPolicy {
        rules: vec![
            FirewallRule::deny("127.0.0.0/8"),
            FirewallRule::deny("::1/128"),
        ],
        default_action: FirewallAction::Allow,
        inspect_tls: false,
    };
    let h = harness(Some(policy), None).await;
    let (origin, mut seen) = http_origin().await;

    let mut client = TcpStream::connect(h.proxy.addr).await.unwrap();
    let request = format!(
        "GET http://localhost:{}/ HTTP/1.1\r\nHost: localhost:{}\r\n\r\n",
        origin.port(),
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403"), "got {}", response);

    let records = wait_for_records(&h.log_path, 1).await;
    assert_eq!(records[0].action, FirewallAction::Deny);
    assert_eq!(records[0].host, "localhost");
    assert!(records[0].matched_rule.is_some());
    assert!(seen.try_recv().is_err(), "denied origin was contacted");

    h.proxy.shutdown().await;
}

#[tokio::test]
async fn test_unknown_source_refused() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ProxyVmRegistry::new(dir.path().join("registry.json"));
    let ca = Arc::new(CertificateAuthority::load_or_generate(&dir.path().join("ca")).unwrap());
    let server = ProxyServer::new(
        registry,
        ca,
        stratus_proxy::default_upstream_tls().unwrap(),
    );
    let proxy = start_proxy("127.0.0.1:0".parse().unwrap(), server)
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_connect_tunnel_relays_bytes() {
    let policy = FirewallPolicy {
        rules: vec![FirewallRule::allow("127.0.0.0/8")],
        default_action: FirewallAction::Deny,
        inspect_tls: false,
    };
    let h = harness(Some(policy), None).await;
    let origin = echo_origin().await;

    let mut client = TcpStream::connect(h.proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", origin).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    drop(client);

    let records = wait_for_records(&h.log_path, 1).await;
    assert_eq!(records[0].matched_rule.as_deref(), Some("127.0.0.0/8"));
    assert!(!records[0].tls_intercepted);
    assert_eq!(records[0].bytes_sent, 4);
}

#[tokio::test]
async fn test_tls_interception_logs_inner_request() {
    // Origin presents a certificate from its own CA; the proxy trusts only that one upstream
    let origin_dir = tempfile::tempdir().unwrap();
    let origin_ca = CertificateAuthority::load_or_generate(origin_dir.path()).unwrap();
    let acceptor = TlsAcceptor::from(origin_ca.server_config_for("localhost").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let _ = read_head(&mut tls).await;
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        tls.shutdown().await.unwrap();
    });

    let policy = FirewallPolicy {
        rules: vec![FirewallRule::allow("localhost")],
        default_action: FirewallAction::Deny,
        inspect_tls: true,
    };
    let h = harness(
        Some(policy),
        Some(client_config_trusting(origin_ca.ca_cert_der())),
    )
    .await;

    let mut client = TcpStream::connect(h.proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", origin_port).as_bytes())
        .await
        .unwrap();
    assert!(read_head(&mut client).await.starts_with("HTTP/1.1 200"));

    // The guest trusts the proxy CA, not the origin's
    let connector = TlsConnector::from(client_config_trusting(h.ca.ca_cert_der()));
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), client)
        .await
        .unwrap();
    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    drop(tls);
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello"));

    let records = wait_for_records(&h.log_path, 1).await;
    assert!(records[0].tls_intercepted);
    assert_eq!(records[0].inner_method.as_deref(), Some("GET"));
    assert_eq!(records[0].inner_path.as_deref(), Some("/secret"));
}
