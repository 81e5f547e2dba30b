//! Credential proxy integration tests: allow-list enforcement, SigV4
//! injection, MCP header rewriting, CONNECT tunneling, and the admin
//! surface, all over real Unix sockets.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};

use workspaced::credentials::CredentialStore;
use workspaced::endpoint::{EndpointClient, TransportEndpoint};
use workspaced::proxy::audit::{EgressAudit, EgressEvent};
use workspaced::proxy::rules::{AllowList, HostPattern, McpHeaderRule, RuleSet};
use workspaced::proxy::{ProxyHandle, ProxyListener, ProxySettings, spawn};

/// Upstream HTTP server recording the headers it receives.
struct Upstream {
    addr: SocketAddr,
    seen_headers: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl Upstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_headers: Arc<Mutex<Vec<HashMap<String, String>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&seen_headers);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let headers: HashMap<String, String> = req
                                .headers()
                                .iter()
                                .filter_map(|(name, value)| {
                                    value
                                        .to_str()
                                        .ok()
                                        .map(|v| (name.as_str().to_lowercase(), v.to_string()))
                                })
                                .collect();
                            seen.lock().unwrap().push(headers);
                            let _ = req.collect().await;
                            Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(
                                r#"{"ok":true}"#,
                            ))))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, seen_headers }
    }

    fn last_headers(&self) -> Option<HashMap<String, String>> {
        self.seen_headers.lock().unwrap().last().cloned()
    }
}

async fn spawn_proxy(
    dir: &std::path::Path,
    rules: RuleSet,
    credentials: Arc<CredentialStore>,
) -> (ProxyHandle, Arc<EgressAudit>) {
    let audit = Arc::new(EgressAudit::with_path(dir.join("egress.jsonl")));
    let handle = spawn(
        ProxySettings {
            sandbox_id: "sbx-test".into(),
            egress: ProxyListener::Unix(dir.join("egress.sock")),
            admin: ProxyListener::Unix(dir.join("admin.sock")),
            rules,
        },
        credentials,
        Arc::clone(&audit),
    )
    .await
    .unwrap();
    (handle, audit)
}

/// Send one raw HTTP request over the egress socket and read the full
/// response (Connection: close).
async fn raw_request(socket: &std::path::Path, request: &str) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_denied_host_gets_403_and_audit_entry() {
    let dir = tempfile::tempdir().unwrap();
    let rules = RuleSet::new(AllowList::from_csv("pypi.org"), vec![]);
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let response = raw_request(
        &dir.path().join("egress.sock"),
        "GET http://evil.example/payload HTTP/1.1\r\nHost: evil.example\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"));
    assert!(response.contains("egress-denied"));
    assert!(response.contains("evil.example"));

    let entries = audit.read_by_host("evil.example").unwrap();
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].event, EgressEvent::Denied { .. }));

    handle.stop().await;
}

#[tokio::test]
async fn test_connect_to_denied_host_is_blocked_before_dialing() {
    let dir = tempfile::tempdir().unwrap();
    let rules = RuleSet::new(AllowList::from_csv("allowed.example"), vec![]);
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let response = raw_request(
        &dir.path().join("egress.sock"),
        "CONNECT evil.example:443 HTTP/1.1\r\nHost: evil.example:443\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"));
    let entries = audit.read_by_host("evil.example").unwrap();
    assert_eq!(entries.len(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_forward_passes_through_allowed_host() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Upstream::start().await;
    let rules = RuleSet::new(AllowList::from_csv("127.0.0.1"), vec![]);
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let response = raw_request(
        &dir.path().join("egress.sock"),
        &format!(
            "GET http://127.0.0.1:{}/index HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Client: sandbox\r\nConnection: close\r\n\r\n",
            upstream.addr.port()
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#"{"ok":true}"#));

    let seen = upstream.last_headers().unwrap();
    // Client headers pass through; no signing was applied.
    assert_eq!(seen.get("x-client").map(String::as_str), Some("sandbox"));
    assert!(!seen.contains_key("authorization"));

    // Forwarded entries are kept (audit constructed with log_all).
    let entries = audit.read_by_host("127.0.0.1").unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0].event {
        EgressEvent::Forwarded { status, signed, .. } => {
            assert_eq!(*status, 200);
            assert!(!signed);
        }
        other => panic!("expected Forwarded, got {other:?}"),
    }

    handle.stop().await;
}

#[tokio::test]
async fn test_signing_policy_injects_sigv4_headers() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Upstream::start().await;
    let rules = RuleSet::new(
        AllowList::from_csv("127.0.0.1"),
        vec![HostPattern::new("127.0.0.1")],
    );
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    credentials
        .rotate(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            Some("session-token".into()),
            "us-east-1",
        )
        .await;
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let body = r#"{"prompt":"hi"}"#;
    let response = raw_request(
        &dir.path().join("egress.sock"),
        &format!(
            "POST http://127.0.0.1:{}/model/claude/invoke HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            upstream.addr.port(),
            body.len(),
            body
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let seen = upstream.last_headers().unwrap();
    let authorization = seen.get("authorization").expect("Authorization injected");
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(authorization.contains("/us-east-1/bedrock/aws4_request"));
    assert!(seen.contains_key("x-amz-date"));
    assert_eq!(
        seen.get("x-amz-security-token").map(String::as_str),
        Some("session-token")
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_missing_credentials_fail_closed_without_leaking() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Upstream::start().await;
    let rules = RuleSet::new(
        AllowList::from_csv("127.0.0.1"),
        vec![HostPattern::new("127.0.0.1")],
    );
    // No material loaded.
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let response = raw_request(
        &dir.path().join("egress.sock"),
        &format!(
            "GET http://127.0.0.1:{}/model HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            upstream.addr.port()
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 500"));
    assert!(response.contains("signing-misconfigured"));
    // Nothing reached the upstream, and no secret appears anywhere.
    assert!(upstream.last_headers().is_none());
    assert!(!response.to_lowercase().contains("secret"));

    handle.stop().await;
}

#[tokio::test]
async fn test_mcp_headers_injected_by_longest_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Upstream::start().await;
    let url_base = format!("http://127.0.0.1:{}", upstream.addr.port());
    let mut rules = RuleSet::new(AllowList::from_csv("127.0.0.1"), vec![]);
    rules.mcp_rules = vec![
        McpHeaderRule {
            url_prefix: format!("{url_base}/"),
            headers: HashMap::from([("x-mcp-auth".to_string(), "broad".to_string())]),
        },
        McpHeaderRule {
            url_prefix: format!("{url_base}/tools/"),
            headers: HashMap::from([("x-mcp-auth".to_string(), "narrow".to_string())]),
        },
    ];
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;

    raw_request(
        &dir.path().join("egress.sock"),
        &format!(
            "GET {url_base}/tools/search HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n"
        ),
    )
    .await;

    let seen = upstream.last_headers().unwrap();
    assert_eq!(seen.get("x-mcp-auth").map(String::as_str), Some("narrow"));

    handle.stop().await;
}

#[tokio::test]
async fn test_connect_tunnels_bytes_end_to_end() {
    let dir = tempfile::tempdir().unwrap();

    // Plain TCP echo upstream.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = echo.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buffer).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buffer[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let rules = RuleSet::new(AllowList::from_csv("127.0.0.1"), vec![]);
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let mut stream = UnixStream::connect(dir.path().join("egress.sock")).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
                echo_addr.port(),
                echo_addr.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Read the 200 response headers.
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        header.push(byte[0]);
    }
    let header_text = String::from_utf8_lossy(&header);
    assert!(header_text.starts_with("HTTP/1.1 200"));

    // The tunnel is transparent both ways.
    stream.write_all(b"tls-handshake-bytes").await.unwrap();
    let mut echoed = [0u8; 19];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"tls-handshake-bytes");

    handle.stop().await;
}

#[tokio::test]
async fn test_admin_surface_swaps_rules_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = Upstream::start().await;
    let rules = RuleSet::new(AllowList::from_csv("nothing.example"), vec![]);
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;
    let egress_sock = dir.path().join("egress.sock");

    // Initially denied.
    let denied = raw_request(
        &egress_sock,
        &format!(
            "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            upstream.addr.port()
        ),
    )
    .await;
    assert!(denied.starts_with("HTTP/1.1 403"));

    // Push new rules over the admin socket, twice.
    let admin = TransportEndpoint::unix(dir.path().join("admin.sock"));
    let client = EndpointClient::new();
    let new_rules = RuleSet::new(AllowList::from_csv("127.0.0.1"), vec![]);
    for _ in 0..2 {
        let response: serde_json::Value = client
            .post_json(&admin, "/admin/update-rules", &new_rules)
            .await
            .unwrap();
        assert_eq!(response["success"], true);
    }

    // Behavior after applying twice is identical to applying once.
    let allowed = raw_request(
        &egress_sock,
        &format!(
            "GET http://127.0.0.1:{}/x HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
            upstream.addr.port()
        ),
    )
    .await;
    assert!(allowed.starts_with("HTTP/1.1 200"));

    let snapshot = handle.rules_snapshot().await;
    assert!(snapshot.allow.allows("127.0.0.1"));
    assert!(!snapshot.allow.allows("nothing.example"));

    handle.stop().await;
}

#[tokio::test]
async fn test_admin_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let rules = RuleSet::default();
    let credentials = Arc::new(CredentialStore::empty("bedrock"));
    let (handle, _audit) = spawn_proxy(dir.path(), rules, credentials).await;

    let client = EndpointClient::new();
    assert!(
        client
            .health(&TransportEndpoint::unix(dir.path().join("admin.sock")))
            .await
    );

    handle.stop().await;
}
