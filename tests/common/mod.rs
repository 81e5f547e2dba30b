//! Shared test harness: a scripted in-sandbox agent server and a
//! fully wired control-plane stack over in-memory fakes.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use workspaced::config::Config;
use workspaced::credentials::CredentialStore;
use workspaced::endpoint::TransportEndpoint;
use workspaced::orchestrator::Orchestrator;
use workspaced::proxy::audit::EgressAudit;
use workspaced::registry::{MemoryRegistry, Registry};
use workspaced::runtime::{MockRuntime, SandboxRuntime};
use workspaced::store::{BlobStore, LocalStore};
use workspaced::sync::FileSync;
use workspaced::warm_pool::{SandboxSource, WarmPool};

/// One scripted `/execute` response: SSE frames in order. A turn that
/// should crash simply omits its terminal `done` frame.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub frames: Vec<(&'static str, &'static str)>,
}

impl ScriptedTurn {
    pub fn completes(mut frames: Vec<(&'static str, &'static str)>) -> Self {
        frames.push(("done", r#"{"usage":{"tokens":7}}"#));
        Self { frames }
    }

    pub fn crashes(frames: Vec<(&'static str, &'static str)>) -> Self {
        Self { frames }
    }
}

/// Minimal scripted agent speaking the sandbox control-plane protocol.
pub struct FakeAgent {
    pub addr: SocketAddr,
    turns: Arc<std::sync::Mutex<VecDeque<ScriptedTurn>>>,
    pub execute_calls: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeAgent {
    pub async fn start(turns: Vec<ScriptedTurn>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let turns = Arc::new(std::sync::Mutex::new(VecDeque::from(turns)));
        let execute_calls = Arc::new(AtomicUsize::new(0));

        let served_turns = Arc::clone(&turns);
        let served_calls = Arc::clone(&execute_calls);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let turns = Arc::clone(&served_turns);
                let calls = Arc::clone(&served_calls);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let turns = Arc::clone(&turns);
                        let calls = Arc::clone(&calls);
                        async move { handle(req, turns, calls).await }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            turns,
            execute_calls,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn endpoint(&self) -> TransportEndpoint {
        TransportEndpoint::Http(self.url())
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(
    req: Request<Incoming>,
    turns: Arc<std::sync::Mutex<VecDeque<ScriptedTurn>>>,
    calls: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/health") => Ok(Response::new(Full::new(Bytes::from(
            r#"{"status":"ok"}"#,
        )))),
        (Method::POST, "/execute") => {
            let _ = req.collect().await;
            calls.fetch_add(1, Ordering::SeqCst);
            let turn = turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ScriptedTurn::completes(vec![]));
            let mut body = String::new();
            for (event, data) in &turn.frames {
                body.push_str(&format!("event: {event}\ndata: {data}\n\n"));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/event-stream")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        (Method::POST, "/exec") => Ok(Response::new(Full::new(Bytes::from(
            r#"{"exit_code":0,"output":""}"#,
        )))),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()),
    }
}

/// A control-plane stack wired over in-memory fakes and a local blob
/// store, pointing every sandbox at one fake agent.
pub struct TestStack {
    pub config: Arc<Config>,
    pub registry: Arc<MemoryRegistry>,
    pub runtime: Arc<MockRuntime>,
    pub pool: Arc<WarmPool>,
    pub orchestrator: Arc<Orchestrator>,
    pub store_dir: std::path::PathBuf,
    pub sync: Arc<FileSync>,
}

pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.container.workspace_root = dir.join("ws").to_string_lossy().to_string();
    config.container.run_root = dir.join("run").to_string_lossy().to_string();
    config.container.idle_stream_timeout_secs = 5;
    config.container.execution_timeout_secs = 30;
    config.warm_pool.min_size = 1;
    config.warm_pool.target_size = 2;
    config.warm_pool.max_size = 5;
    config.warm_pool.create_timeout_secs = 5;
    config.storage.backend = "local".to_string();
    config.storage.local_dir = dir.join("store").to_string_lossy().to_string();
    config.storage.tenant = "tenant-a".to_string();
    config.storage.flush_debounce_ms = 50;
    config.proxy.domain_whitelist = "pypi.org".to_string();
    config.proxy.audit_path = dir.join("egress.jsonl").to_string_lossy().to_string();
    config
}

pub async fn build_stack(dir: &std::path::Path, agent_endpoint: TransportEndpoint) -> TestStack {
    build_stack_with_config(test_config(dir), agent_endpoint).await
}

pub async fn build_stack_with_config(
    config: Config,
    agent_endpoint: TransportEndpoint,
) -> TestStack {
    let config = Arc::new(config);
    let registry = Arc::new(MemoryRegistry::new());
    let runtime = Arc::new(MockRuntime::new(agent_endpoint));
    let store_dir = std::path::PathBuf::from(&config.storage.local_dir);
    std::fs::create_dir_all(&store_dir).unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(LocalStore::new(&store_dir));
    let sync = Arc::new(FileSync::new(Some(store), &config.storage.tenant));
    let audit = Arc::new(EgressAudit::with_path(
        std::path::PathBuf::from(&config.proxy.audit_path),
    ));
    let credentials = Arc::new(CredentialStore::empty("bedrock"));

    let pool = WarmPool::new(
        registry.clone() as Arc<dyn Registry>,
        runtime.clone() as Arc<dyn SandboxRuntime>,
        &config,
    )
    .unwrap();

    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone() as Arc<dyn Registry>,
        runtime.clone() as Arc<dyn SandboxRuntime>,
        pool.clone() as Arc<dyn SandboxSource>,
        credentials,
        sync.clone(),
        audit,
    );

    TestStack {
        config,
        registry,
        runtime,
        pool,
        orchestrator,
        store_dir,
        sync,
    }
}

/// Drain a relay receiver to completion, returning event kinds with
/// payloads.
pub async fn collect_events(
    mut rx: tokio::sync::mpsc::Receiver<workspaced::events::RelayEvent>,
) -> Vec<workspaced::events::RelayEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
