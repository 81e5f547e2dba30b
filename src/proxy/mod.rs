//! Per-sandbox credential injection proxy.
//!
//! The sole egress path for an isolated sandbox. Listens on a Unix
//! socket mounted into the sandbox (or TCP in sidecar mode), enforces
//! the host allow-list, tunnels CONNECT requests without terminating
//! TLS, signs forward requests for hosts matching the signing policy,
//! and injects MCP headers by longest URL prefix. Credential material
//! only ever exists on this side of the socket.

pub mod audit;
pub mod dns;
pub mod rules;
pub mod sigv4;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::endpoint::TransportEndpoint;
use crate::proxy::audit::{EgressAudit, EgressEntry, EgressEvent};
use crate::proxy::dns::DnsCache;
use crate::proxy::rules::RuleSet;

type ProxyBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::io::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty() -> ProxyBody {
    full(Bytes::new())
}

/// Hop-by-hop headers never relayed in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Where a proxy surface listens.
#[derive(Debug, Clone)]
pub enum ProxyListener {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl ProxyListener {
    fn endpoint(&self, bound: Option<SocketAddr>) -> TransportEndpoint {
        match self {
            ProxyListener::Unix(path) => TransportEndpoint::Unix(path.clone()),
            ProxyListener::Tcp(addr) => {
                let addr = bound.unwrap_or(*addr);
                TransportEndpoint::Http(format!("http://{addr}"))
            }
        }
    }
}

/// Spawn-time settings for one proxy instance.
#[derive(Clone)]
pub struct ProxySettings {
    pub sandbox_id: String,
    /// Egress surface, reachable from inside the sandbox.
    pub egress: ProxyListener,
    /// Admin surface, reachable only from the control plane.
    pub admin: ProxyListener,
    pub rules: RuleSet,
}

/// Admin `POST /admin/config` payload: initial push of allow-list and,
/// in sidecar mode, credential material.
#[derive(Debug, Deserialize)]
struct AdminConfig {
    #[serde(default)]
    rules: Option<RuleSet>,
    #[serde(default)]
    credentials: Option<AdminCredentials>,
}

#[derive(Debug, Deserialize)]
struct AdminCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    region: String,
}

struct ProxyState {
    sandbox_id: String,
    /// Per-sandbox nonce tying audit entries to this sandbox.
    nonce: String,
    rules: RwLock<Arc<RuleSet>>,
    credentials: Arc<CredentialStore>,
    audit: Arc<EgressAudit>,
    dns: DnsCache,
    upstream: reqwest::Client,
}

impl ProxyState {
    async fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&*self.rules.read().await)
    }

    async fn swap_rules(&self, rules: RuleSet) {
        let allow_patterns = rules.allow.len();
        let mcp_rules = rules.mcp_rules.len();
        *self.rules.write().await = Arc::new(rules);
        let _ = self.audit.log(EgressEntry::new(
            &self.sandbox_id,
            None,
            EgressEvent::RulesUpdated {
                allow_patterns,
                mcp_rules,
            },
        ));
    }
}

/// Running proxy instance. Stopping the handle tears down both
/// listeners and unlinks the sockets.
pub struct ProxyHandle {
    pub sandbox_id: String,
    pub endpoint: TransportEndpoint,
    pub admin_endpoint: TransportEndpoint,
    state: Arc<ProxyState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    socket_paths: Vec<PathBuf>,
}

impl ProxyHandle {
    /// Atomic swap of the rule snapshot (in-process admin path).
    pub async fn update_rules(&self, rules: RuleSet) {
        self.state.swap_rules(rules).await;
    }

    pub async fn rules_snapshot(&self) -> Arc<RuleSet> {
        self.state.rules().await
    }

    pub fn nonce(&self) -> &str {
        &self.state.nonce
    }

    /// Stop both listeners and remove socket files.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        for path in &self.socket_paths {
            let _ = std::fs::remove_file(path);
        }
        info!(sandbox_id = %self.sandbox_id, "credential proxy stopped");
    }
}

/// Start the egress and admin surfaces for one sandbox.
pub async fn spawn(
    settings: ProxySettings,
    credentials: Arc<CredentialStore>,
    audit: Arc<EgressAudit>,
) -> Result<ProxyHandle> {
    let state = Arc::new(ProxyState {
        sandbox_id: settings.sandbox_id.clone(),
        nonce: uuid::Uuid::new_v4().to_string(),
        rules: RwLock::new(Arc::new(settings.rules.clone())),
        credentials,
        audit,
        dns: DnsCache::default(),
        upstream: reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to build upstream client")?,
    });

    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();
    let mut socket_paths = Vec::new();

    // Egress surface, world-connectable inside the mount; the sandbox
    // user is non-root.
    let (egress_listener, egress_endpoint) =
        bind(&settings.egress, 0o666, &mut socket_paths).await?;
    tasks.push(tokio::spawn(accept_loop(
        egress_listener,
        Arc::clone(&state),
        shutdown.subscribe(),
        Surface::Egress,
    )));

    // Admin surface, control-plane only.
    let (admin_listener, admin_endpoint) = bind(&settings.admin, 0o600, &mut socket_paths).await?;
    tasks.push(tokio::spawn(accept_loop(
        admin_listener,
        Arc::clone(&state),
        shutdown.subscribe(),
        Surface::Admin,
    )));

    info!(
        sandbox_id = %settings.sandbox_id,
        egress = %egress_endpoint,
        admin = %admin_endpoint,
        "credential proxy listening"
    );

    Ok(ProxyHandle {
        sandbox_id: settings.sandbox_id,
        endpoint: egress_endpoint,
        admin_endpoint,
        state,
        shutdown,
        tasks,
        socket_paths,
    })
}

enum BoundListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl BoundListener {
    async fn accept(&self) -> std::io::Result<Box<dyn Io>> {
        match self {
            BoundListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            BoundListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

async fn bind(
    listener: &ProxyListener,
    socket_mode: u32,
    socket_paths: &mut Vec<PathBuf>,
) -> Result<(BoundListener, TransportEndpoint)> {
    match listener {
        ProxyListener::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let _ = std::fs::remove_file(path);
            let bound = UnixListener::bind(path)
                .with_context(|| format!("Failed to bind proxy socket {}", path.display()))?;
            // The in-sandbox user is non-root; open up the egress
            // socket, keep the admin socket owner-only.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(socket_mode))?;
            socket_paths.push(path.clone());
            Ok((BoundListener::Unix(bound), listener.endpoint(None)))
        }
        ProxyListener::Tcp(addr) => {
            let bound = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind proxy address {addr}"))?;
            let local = bound.local_addr().ok();
            Ok((BoundListener::Tcp(bound), listener.endpoint(local)))
        }
    }
}

#[derive(Clone, Copy)]
enum Surface {
    Egress,
    Admin,
}

async fn accept_loop(
    listener: BoundListener,
    state: Arc<ProxyState>,
    mut shutdown: watch::Receiver<bool>,
    surface: Surface,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move {
                                    let response = match surface {
                                        Surface::Egress => handle_egress(req, state).await,
                                        Surface::Admin => handle_admin(req, state).await,
                                    };
                                    Ok::<_, std::convert::Infallible>(response)
                                }
                            });
                            let conn = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .with_upgrades();
                            if let Err(e) = conn.await {
                                debug!("proxy connection error: {e:?}");
                            }
                        });
                    }
                    Err(e) => warn!("proxy accept error: {e}"),
                }
            }
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body.to_string()))
        .unwrap_or_else(|_| Response::new(empty()))
}

fn denial(host: &str) -> Response<ProxyBody> {
    json_response(
        StatusCode::FORBIDDEN,
        serde_json::json!({ "code": "egress-denied", "host": host }),
    )
}

/// One request through the egress pipeline: allow-list check, then
/// CONNECT tunnel or signed/rewritten forward.
async fn handle_egress(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        handle_connect(req, state).await
    } else {
        handle_forward(req, state).await
    }
}

async fn handle_connect(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "code": "bad-request", "reason": "CONNECT requires host:port" }),
        );
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    let rules = state.rules().await;
    if !rules.allow.allows(&host) {
        let _ = state.audit.log(EgressEntry::new(
            &state.sandbox_id,
            None,
            EgressEvent::Denied {
                host: host.clone(),
                reason: "not in allow-list".into(),
            },
        ));
        return denial(&host);
    }

    // Connect upstream before answering, so the client only sees 200
    // once the tunnel really exists.
    let upstream = match connect_upstream(&state, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host, "CONNECT upstream failed: {e}");
            return json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "code": "upstream-error", "host": host }),
            );
        }
    };

    let tunnel_state = Arc::clone(&state);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                let mut upstream = upstream;
                // TLS stays end-to-end; both directions are shut down
                // in this one place when either side hits EOF.
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((up, down)) => {
                        let _ = tunnel_state.audit.log(EgressEntry::new(
                            &tunnel_state.sandbox_id,
                            None,
                            EgressEvent::Tunneled {
                                host,
                                bytes_up: up,
                                bytes_down: down,
                            },
                        ));
                    }
                    Err(e) => debug!(host, "tunnel closed with error: {e}"),
                }
            }
            Err(e) => debug!("CONNECT upgrade failed: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty())
        .unwrap_or_else(|_| Response::new(empty()))
}

async fn connect_upstream(state: &ProxyState, host: &str, port: u16) -> Result<TcpStream> {
    let addrs = state.dns.resolve(host, port).await?;
    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    // Every cached address failed; force a fresh resolution next time.
    state.dns.evict(host).await;
    match last_err {
        Some(e) => Err(e).context("upstream connect failed"),
        None => bail!("no addresses for {host}"),
    }
}

async fn handle_forward(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();

    // Forward requests arrive in absolute form; anything else has no
    // routable destination.
    let (Some(scheme), Some(authority)) = (parts.uri.scheme(), parts.uri.authority()) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "code": "bad-request",
                "reason": "forward proxy requests must use absolute-form URIs"
            }),
        );
    };
    let scheme = scheme.to_string();
    let authority = authority.clone();
    let host = authority.host().to_string();

    let rules = state.rules().await;
    if !rules.allow.allows(&host) {
        let _ = state.audit.log(EgressEntry::new(
            &state.sandbox_id,
            None,
            EgressEvent::Denied {
                host: host.clone(),
                reason: "not in allow-list".into(),
            },
        ));
        return denial(&host);
    }

    let url = parts.uri.to_string();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();

    // Buffered so the payload hash can be computed for signing.
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "code": "bad-request", "reason": e.to_string() }),
            );
        }
    };

    let mut request = state
        .upstream
        .request(
            reqwest::Method::from_bytes(method.as_str().as_bytes())
                .unwrap_or(reqwest::Method::GET),
            &url,
        )
        .body(body_bytes.to_vec());

    for (name, value) in parts.headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || lower == "host" || lower == "content-length" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }

    // MCP header injection: longest URL prefix wins.
    if let Some(rule) = rules.mcp_headers_for(&url) {
        for (name, value) in &rule.headers {
            request = request.header(name, value);
        }
    }

    let mut signed = false;
    let mut nonce = None;
    if rules.requires_signing(&host) {
        let Some(material) = state.credentials.issue(&state.nonce).await else {
            // Internal code only; the secret is never part of the body.
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "code": "signing-misconfigured" }),
            );
        };
        let headers = sigv4::sign_request(
            &material,
            state.credentials.signing_service(),
            method.as_str(),
            &host,
            &path,
            &query,
            &body_bytes,
            chrono::Utc::now(),
        );
        request = request
            .header("Authorization", headers.authorization)
            .header("x-amz-date", headers.x_amz_date);
        if let Some(token) = headers.x_amz_security_token {
            request = request.header("x-amz-security-token", token);
        }
        signed = true;
        nonce = Some(material.nonce);
    }

    let _ = scheme; // scheme rides inside `url`

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(host, "forward upstream failed: {e}");
            state.dns.evict(&host).await;
            let _ = state.audit.log(EgressEntry::new(
                &state.sandbox_id,
                nonce,
                EgressEvent::Forwarded {
                    host,
                    method: method.to_string(),
                    status: 502,
                    signed,
                },
            ));
            return json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "code": "upstream-error" }),
            );
        }
    };

    let status =
        StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let _ = state.audit.log(EgressEntry::new(
        &state.sandbox_id,
        nonce,
        EgressEvent::Forwarded {
            host,
            method: method.to_string(),
            status: status.as_u16(),
            signed,
        },
    ));

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let stream = upstream_response
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| std::io::Error::other(e.to_string()));
    builder
        .body(StreamBody::new(stream).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty()))
}

/// Admin surface: health, rule swap, initial config push. Reachable
/// only from the control plane (socket permissions in UDS mode).
async fn handle_admin(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    match (req.method().clone(), path.as_str()) {
        (Method::GET, "/health") => {
            json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
        }
        (Method::POST, "/admin/update-rules") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({ "code": "bad-request", "reason": e.to_string() }),
                    );
                }
            };
            match serde_json::from_slice::<RuleSet>(&body) {
                Ok(rules) => {
                    state.swap_rules(rules).await;
                    json_response(StatusCode::OK, serde_json::json!({ "success": true }))
                }
                Err(e) => json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "code": "bad-request", "reason": e.to_string() }),
                ),
            }
        }
        (Method::POST, "/admin/config") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({ "code": "bad-request", "reason": e.to_string() }),
                    );
                }
            };
            match serde_json::from_slice::<AdminConfig>(&body) {
                Ok(config) => {
                    if let Some(rules) = config.rules {
                        state.swap_rules(rules).await;
                    }
                    if let Some(credentials) = config.credentials {
                        state
                            .credentials
                            .rotate(
                                &credentials.access_key_id,
                                &credentials.secret_access_key,
                                credentials.session_token,
                                &credentials.region,
                            )
                            .await;
                    }
                    json_response(StatusCode::OK, serde_json::json!({ "success": true }))
                }
                Err(e) => json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({ "code": "bad-request", "reason": e.to_string() }),
                ),
            }
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "code": "not-found" }),
        ),
    }
}
