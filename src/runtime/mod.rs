//! Container-runtime abstraction for workspace sandboxes.
//!
//! Every backend exposes the same capability set: create with full
//! isolation, start, readiness probe, destroy, exec, list by workspace
//! labels, and log fetch. The orchestrator, warm pool, and GC only ever
//! see this trait, so local Docker and Podman (and a future remote
//! backend) are interchangeable.

pub mod docker;

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ContainerConfig;
use crate::endpoint::{EndpointClient, TransportEndpoint};
use crate::error::WorkspaceError;
use crate::registry::now_ms;

/// Labels every workspace sandbox carries in the runtime.
pub const LABEL_WORKSPACE: &str = "workspace";
pub const LABEL_CONVERSATION: &str = "workspace.conversation_id";
pub const LABEL_CREATED_AT: &str = "workspace.created_at";

/// Mount points inside the sandbox.
pub const SANDBOX_WORKSPACE_MOUNT: &str = "/workspace";
pub const SANDBOX_SOCKETS_MOUNT: &str = "/run/workspace";

/// Network posture for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network device at all; the proxy socket is the only way out.
    Disabled,
    /// Bridged network; egress still goes through the proxy via the
    /// standard proxy environment variables.
    Restricted,
}

impl NetworkMode {
    pub fn from_config(mode: &str) -> Result<Self> {
        match mode {
            "disabled" => Ok(NetworkMode::Disabled),
            "restricted" => Ok(NetworkMode::Restricted),
            other => bail!("unknown network mode: {other:?}. Valid options: disabled, restricted"),
        }
    }
}

/// Host-side filesystem layout for one sandbox.
///
/// The sockets dir is bind-mounted into the sandbox; it carries the
/// agent socket (created by the in-sandbox agent) and the proxy egress
/// socket (created by the control plane). The admin socket stays
/// outside the mount so the sandbox can never reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    pub workspace_dir: PathBuf,
    pub sockets_dir: PathBuf,
    pub admin_sock: PathBuf,
}

impl SandboxPaths {
    pub fn new(workspace_root: &str, run_root: &str, name: &str) -> Self {
        let run_base = Path::new(run_root).join(name);
        Self {
            workspace_dir: Path::new(workspace_root).join(name),
            sockets_dir: run_base.join("mnt"),
            admin_sock: run_base.join("admin.sock"),
        }
    }

    pub fn agent_sock(&self) -> PathBuf {
        self.sockets_dir.join("agent.sock")
    }

    pub fn egress_sock(&self) -> PathBuf {
        self.sockets_dir.join("egress.sock")
    }

    /// Create the directories and open up the sockets dir so the
    /// non-root sandbox user can create and read sockets in it,
    /// whether or not user-namespace remapping is in effect.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.workspace_dir)?;
        std::fs::create_dir_all(&self.sockets_dir)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.sockets_dir, std::fs::Permissions::from_mode(0o777))?;
        Ok(())
    }

    /// Remove everything this sandbox left on the host.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.workspace_dir);
        if let Some(run_base) = self.admin_sock.parent() {
            let _ = std::fs::remove_dir_all(run_base);
        }
    }
}

/// Everything a backend needs to launch one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Short unique name; backends derive their native names from it.
    pub name: String,
    pub image: String,
    /// Empty for warm sandboxes.
    pub conversation_id: String,
    pub env: Vec<(String, String)>,
    pub network_mode: NetworkMode,
    pub cpu_limit: f64,
    pub memory_mb: u64,
    pub pids_limit: i64,
    pub disk_limit_mb: u64,
    pub paths: SandboxPaths,
    pub created_at_ms: i64,
}

impl SandboxSpec {
    /// Build a spec from configuration, wiring the standard proxy
    /// environment variables at the in-sandbox mount points.
    pub fn from_config(config: &ContainerConfig, name: &str) -> Result<Self> {
        let paths = SandboxPaths::new(&config.workspace_root, &config.run_root, name);
        let egress = format!("unix://{SANDBOX_SOCKETS_MOUNT}/egress.sock");
        let env = vec![
            ("HTTP_PROXY".to_string(), egress.clone()),
            ("HTTPS_PROXY".to_string(), egress.clone()),
            ("http_proxy".to_string(), egress.clone()),
            ("https_proxy".to_string(), egress),
            (
                "WORKSPACE_DIR".to_string(),
                SANDBOX_WORKSPACE_MOUNT.to_string(),
            ),
            (
                "AGENT_SOCKET".to_string(),
                format!("{SANDBOX_SOCKETS_MOUNT}/agent.sock"),
            ),
        ];
        Ok(Self {
            name: name.to_string(),
            image: config.image.clone(),
            conversation_id: String::new(),
            env,
            network_mode: NetworkMode::from_config(&config.network_mode)?,
            cpu_limit: config.cpu_limit,
            memory_mb: config.memory_mb,
            pids_limit: config.pids_limit,
            disk_limit_mb: config.disk_limit_mb,
            paths,
            created_at_ms: now_ms(),
        })
    }

    pub fn agent_endpoint(&self) -> TransportEndpoint {
        TransportEndpoint::Unix(self.paths.agent_sock())
    }
}

/// A sandbox as the runtime reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSandbox {
    /// Backend-native handle (container id).
    pub sandbox_id: String,
    pub name: String,
    /// From the conversation label; empty when unbound.
    pub conversation_id: String,
    pub created_at_ms: i64,
    pub agent_endpoint: TransportEndpoint,
    pub running: bool,
}

/// Result of executing a command inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability set the core requires from any container-runtime backend.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Launch a fully isolated sandbox. The sandbox must not be able to
    /// reach the network except through the mounted proxy socket.
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeSandbox>;

    async fn start(&self, sandbox_id: &str) -> Result<()>;

    /// Poll the in-sandbox agent until it reports healthy or the
    /// timeout elapses.
    async fn wait_ready(&self, endpoint: &TransportEndpoint, timeout: Duration) -> Result<()>;

    /// One-shot agent liveness probe.
    async fn probe(&self, endpoint: &TransportEndpoint) -> bool;

    /// Graceful stop (grace period) then force remove, including
    /// ephemeral volumes.
    async fn destroy(&self, sandbox_id: &str, grace: Duration) -> Result<()>;

    /// Execute a command, returning exit code and combined output.
    async fn exec(&self, sandbox_id: &str, cmd: &[String], timeout: Duration)
    -> Result<ExecOutcome>;

    /// Execute a command, returning the exit code and raw stdout bytes.
    async fn exec_binary(
        &self,
        sandbox_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<(i64, Vec<u8>)>;

    /// Enumerate sandboxes carrying the workspace label.
    async fn list(&self) -> Result<Vec<RuntimeSandbox>>;

    /// Recent stdout/stderr for diagnostics.
    async fn logs(&self, sandbox_id: &str, tail: usize) -> Result<String>;

    /// Whether the backend itself is reachable.
    async fn ping(&self) -> bool;
}

/// Write a file into a sandbox workspace through the exec capability.
/// Used by the sync path when the backend has no direct workspace
/// mount; small files go through a base64 pipe instead of a tar
/// archive.
pub async fn write_file_via_exec(
    runtime: &dyn SandboxRuntime,
    sandbox_id: &str,
    path: &str,
    content: &[u8],
) -> Result<()> {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let target = path.trim_start_matches('/');
    let cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo '{encoded}' | base64 -d > {SANDBOX_WORKSPACE_MOUNT}/{target}"),
    ];
    let outcome = runtime
        .exec(sandbox_id, &cmd, Duration::from_secs(30))
        .await?;
    if !outcome.is_success() {
        bail!(
            "failed to write {path} into sandbox {sandbox_id}: {}",
            outcome.output
        );
    }
    Ok(())
}

/// Read a file out of a sandbox workspace through the exec capability.
pub async fn read_file_via_exec(
    runtime: &dyn SandboxRuntime,
    sandbox_id: &str,
    path: &str,
) -> Result<Vec<u8>> {
    let target = path.trim_start_matches('/');
    let cmd = vec![
        "cat".to_string(),
        format!("{SANDBOX_WORKSPACE_MOUNT}/{target}"),
    ];
    let (exit_code, bytes) = runtime
        .exec_binary(sandbox_id, &cmd, Duration::from_secs(30))
        .await?;
    if exit_code != 0 {
        bail!("failed to read {path} from sandbox {sandbox_id} (exit {exit_code})");
    }
    Ok(bytes)
}

/// Shared readiness polling used by backends.
pub async fn poll_until_ready(
    client: &EndpointClient,
    endpoint: &TransportEndpoint,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.health(endpoint).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WorkspaceError::SandboxUnhealthy {
                sandbox_id: endpoint.to_string(),
            }
            .into());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// In-memory runtime for tests and dry runs. Sandboxes exist only as
/// records; health and creation failures are scriptable.
pub struct MockRuntime {
    default_endpoint: TransportEndpoint,
    inner: std::sync::Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    sandboxes: std::collections::HashMap<String, RuntimeSandbox>,
    destroyed: Vec<String>,
    /// Endpoint strings explicitly marked unhealthy.
    unhealthy: std::collections::HashSet<String>,
    /// Fail the next N create calls.
    fail_creates: usize,
    exec_log: Vec<Vec<String>>,
    counter: u64,
}

impl MockRuntime {
    pub fn new(default_endpoint: TransportEndpoint) -> Self {
        Self {
            default_endpoint,
            inner: std::sync::Mutex::new(MockInner::default()),
        }
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.inner.lock().unwrap().fail_creates = n;
    }

    pub fn set_endpoint_health(&self, endpoint: &TransportEndpoint, healthy: bool) {
        let mut inner = self.inner.lock().unwrap();
        if healthy {
            inner.unhealthy.remove(&endpoint.to_string());
        } else {
            inner.unhealthy.insert(endpoint.to_string());
        }
    }

    /// Backdate a sandbox for age-based tests.
    pub fn set_created_at(&self, sandbox_id: &str, created_at_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sandbox) = inner.sandboxes.get_mut(sandbox_id) {
            sandbox.created_at_ms = created_at_ms;
        }
    }

    /// Register a sandbox directly, bypassing `create`; used to stage
    /// orphans.
    pub fn inject_sandbox(&self, sandbox: RuntimeSandbox) {
        self.inner
            .lock()
            .unwrap()
            .sandboxes
            .insert(sandbox.sandbox_id.clone(), sandbox);
    }

    pub fn destroyed_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().destroyed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().sandboxes.len()
    }

    pub fn exec_history(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().exec_log.clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeSandbox> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_creates > 0 {
            inner.fail_creates -= 1;
            bail!("mock runtime create failure");
        }
        inner.counter += 1;
        let sandbox = RuntimeSandbox {
            sandbox_id: format!("mock-{}-{}", spec.name, inner.counter),
            name: spec.name.clone(),
            conversation_id: spec.conversation_id.clone(),
            created_at_ms: spec.created_at_ms,
            agent_endpoint: self.default_endpoint.clone(),
            running: false,
        };
        inner
            .sandboxes
            .insert(sandbox.sandbox_id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sandboxes.get_mut(sandbox_id) {
            Some(sandbox) => {
                sandbox.running = true;
                Ok(())
            }
            None => bail!("no such sandbox: {sandbox_id}"),
        }
    }

    async fn wait_ready(&self, endpoint: &TransportEndpoint, _timeout: Duration) -> Result<()> {
        if self.probe(endpoint).await {
            Ok(())
        } else {
            Err(WorkspaceError::SandboxUnhealthy {
                sandbox_id: endpoint.to_string(),
            }
            .into())
        }
    }

    async fn probe(&self, endpoint: &TransportEndpoint) -> bool {
        !self
            .inner
            .lock()
            .unwrap()
            .unhealthy
            .contains(&endpoint.to_string())
    }

    async fn destroy(&self, sandbox_id: &str, _grace: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sandboxes.remove(sandbox_id);
        inner.destroyed.push(sandbox_id.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _sandbox_id: &str,
        cmd: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutcome> {
        self.inner.lock().unwrap().exec_log.push(cmd.to_vec());
        Ok(ExecOutcome {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn exec_binary(
        &self,
        _sandbox_id: &str,
        cmd: &[String],
        _timeout: Duration,
    ) -> Result<(i64, Vec<u8>)> {
        self.inner.lock().unwrap().exec_log.push(cmd.to_vec());
        Ok((0, Vec::new()))
    }

    async fn list(&self) -> Result<Vec<RuntimeSandbox>> {
        Ok(self.inner.lock().unwrap().sandboxes.values().cloned().collect())
    }

    async fn logs(&self, sandbox_id: &str, _tail: usize) -> Result<String> {
        Ok(format!("[mock logs for {sandbox_id}]"))
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;

    #[test]
    fn test_network_mode_parsing() {
        assert_eq!(
            NetworkMode::from_config("disabled").unwrap(),
            NetworkMode::Disabled
        );
        assert_eq!(
            NetworkMode::from_config("restricted").unwrap(),
            NetworkMode::Restricted
        );
        assert!(NetworkMode::from_config("host").is_err());
    }

    #[test]
    fn test_sandbox_paths_layout() {
        let paths = SandboxPaths::new("/var/ws", "/var/run-ws", "ws-abc");
        assert_eq!(paths.workspace_dir, PathBuf::from("/var/ws/ws-abc"));
        assert_eq!(paths.sockets_dir, PathBuf::from("/var/run-ws/ws-abc/mnt"));
        assert_eq!(paths.agent_sock(), PathBuf::from("/var/run-ws/ws-abc/mnt/agent.sock"));
        assert_eq!(paths.egress_sock(), PathBuf::from("/var/run-ws/ws-abc/mnt/egress.sock"));
        // Admin socket lives outside the mounted dir.
        assert_eq!(paths.admin_sock, PathBuf::from("/var/run-ws/ws-abc/admin.sock"));
        assert!(!paths.admin_sock.starts_with(&paths.sockets_dir));
    }

    #[test]
    fn test_spec_from_config_sets_proxy_env() {
        let config = ContainerConfig::default();
        let spec = SandboxSpec::from_config(&config, "ws-1").unwrap();
        let env: std::collections::HashMap<_, _> = spec.env.iter().cloned().collect();
        assert_eq!(env["HTTPS_PROXY"], "unix:///run/workspace/egress.sock");
        assert_eq!(env["AGENT_SOCKET"], "/run/workspace/agent.sock");
        assert_eq!(spec.network_mode, NetworkMode::Disabled);
        assert!(spec.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let runtime = MockRuntime::new(TransportEndpoint::Http("http://127.0.0.1:1".into()));
        let spec = SandboxSpec::from_config(&ContainerConfig::default(), "ws-1").unwrap();

        let sandbox = runtime.create(&spec).await.unwrap();
        assert!(!sandbox.running);
        runtime.start(&sandbox.sandbox_id).await.unwrap();
        assert_eq!(runtime.live_count(), 1);

        runtime
            .destroy(&sandbox.sandbox_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(runtime.live_count(), 0);
        assert_eq!(runtime.destroyed_ids(), vec![sandbox.sandbox_id]);
    }

    #[tokio::test]
    async fn test_mock_scripted_create_failures() {
        let runtime = MockRuntime::new(TransportEndpoint::Http("http://127.0.0.1:1".into()));
        let spec = SandboxSpec::from_config(&ContainerConfig::default(), "ws-1").unwrap();

        runtime.fail_next_creates(2);
        assert!(runtime.create(&spec).await.is_err());
        assert!(runtime.create(&spec).await.is_err());
        assert!(runtime.create(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_file_fallback_shapes_commands() {
        let runtime = MockRuntime::new(TransportEndpoint::Http("http://127.0.0.1:1".into()));
        write_file_via_exec(&runtime, "sbx-1", "out/result.txt", b"data")
            .await
            .unwrap();
        read_file_via_exec(&runtime, "sbx-1", "out/result.txt")
            .await
            .unwrap();

        let history = runtime.exec_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0][0], "sh");
        assert!(history[0][2].contains("base64 -d > /workspace/out/result.txt"));
        assert_eq!(history[1], vec!["cat", "/workspace/out/result.txt"]);
    }

    #[tokio::test]
    async fn test_mock_endpoint_health_override() {
        let endpoint = TransportEndpoint::Http("http://127.0.0.1:1".into());
        let runtime = MockRuntime::new(endpoint.clone());
        assert!(runtime.probe(&endpoint).await);
        runtime.set_endpoint_health(&endpoint, false);
        assert!(!runtime.probe(&endpoint).await);
        assert!(
            runtime
                .wait_ready(&endpoint, Duration::from_millis(10))
                .await
                .is_err()
        );
    }
}
