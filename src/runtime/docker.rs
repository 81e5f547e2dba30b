//! Docker/Podman sandbox runtime using bollard.
//!
//! Sandboxes run with the full isolation set: no network device (or a
//! bridge when "restricted"), read-only root filesystem with a sized
//! tmpfs scratch, all capabilities dropped, no-new-privileges, private
//! IPC, pids and cpu/memory caps, and the workspace/socket trees bind
//! mounted from the host.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointClient, TransportEndpoint};
use crate::registry::ManagerType;
use crate::runtime::{
    ExecOutcome, LABEL_CONVERSATION, LABEL_CREATED_AT, LABEL_WORKSPACE, NetworkMode,
    RuntimeSandbox, SANDBOX_SOCKETS_MOUNT, SANDBOX_WORKSPACE_MOUNT, SandboxPaths, SandboxRuntime,
    SandboxSpec, poll_until_ready,
};

/// Docker-compatible runtime backend (covers Podman via its socket).
pub struct DockerRuntime {
    client: Docker,
    manager_type: ManagerType,
    agent_probe: EndpointClient,
    /// Mirrors [`crate::config::ContainerConfig::run_root`]; needed to
    /// reconstruct agent endpoints from listed containers.
    run_root: String,
    workspace_root: String,
}

impl DockerRuntime {
    /// Connect to the runtime daemon. An empty socket means the local
    /// default; Podman deployments point this at their socket path.
    pub async fn connect(
        manager_type: ManagerType,
        runtime_socket: &str,
        workspace_root: &str,
        run_root: &str,
    ) -> Result<Self> {
        let client = if runtime_socket.is_empty() {
            Docker::connect_with_local_defaults()
                .context("Failed to connect to container runtime. Is the daemon running?")?
        } else {
            Docker::connect_with_socket(
                runtime_socket,
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .with_context(|| format!("Failed to connect to runtime socket {runtime_socket}"))?
        };

        client
            .ping()
            .await
            .context("Failed to ping container runtime")?;
        debug!(%manager_type, "connected to container runtime");

        Ok(Self {
            client,
            manager_type,
            agent_probe: EndpointClient::new(),
            run_root: run_root.to_string(),
            workspace_root: workspace_root.to_string(),
        })
    }

    pub fn manager_type(&self) -> ManagerType {
        self.manager_type
    }

    /// Container name for a sandbox.
    pub fn container_name(name: &str) -> String {
        format!("workspaced-{name}")
    }

    /// Pull the sandbox image if not already present.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("pull status: {status}");
                    }
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to pull image {image}: {e}"));
                }
            }
        }
        Ok(())
    }

    fn build_host_config(&self, spec: &SandboxSpec) -> HostConfig {
        let binds = vec![
            format!(
                "{}:{SANDBOX_WORKSPACE_MOUNT}",
                spec.paths.workspace_dir.display()
            ),
            format!(
                "{}:{SANDBOX_SOCKETS_MOUNT}",
                spec.paths.sockets_dir.display()
            ),
        ];

        // Sized writable scratch on an otherwise read-only rootfs.
        let tmpfs = HashMap::from([(
            "/tmp".to_string(),
            format!("size={}m", spec.disk_limit_mb),
        )]);

        let network_mode = match spec.network_mode {
            NetworkMode::Disabled => "none",
            NetworkMode::Restricted => "bridge",
        };

        HostConfig {
            binds: Some(binds),
            tmpfs: Some(tmpfs),
            nano_cpus: Some((spec.cpu_limit * 1e9) as i64),
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(network_mode.to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ipc_mode: Some("private".to_string()),
            ..Default::default()
        }
    }

    fn sandbox_from_labels(
        &self,
        id: String,
        names: Vec<String>,
        labels: HashMap<String, String>,
        state: Option<String>,
    ) -> RuntimeSandbox {
        let name = names
            .first()
            .map(|n| {
                n.trim_start_matches('/')
                    .trim_start_matches("workspaced-")
                    .to_string()
            })
            .unwrap_or_else(|| id.chars().take(12).collect());
        let paths = SandboxPaths::new(&self.workspace_root, &self.run_root, &name);
        RuntimeSandbox {
            sandbox_id: id,
            conversation_id: labels.get(LABEL_CONVERSATION).cloned().unwrap_or_default(),
            created_at_ms: labels
                .get(LABEL_CREATED_AT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            agent_endpoint: TransportEndpoint::Unix(paths.agent_sock()),
            running: state.as_deref() == Some("running"),
            name,
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<RuntimeSandbox> {
        self.ensure_image(&spec.image).await?;
        spec.paths.ensure()?;

        let mut labels = HashMap::new();
        labels.insert(LABEL_WORKSPACE.to_string(), "true".to_string());
        labels.insert(
            LABEL_CONVERSATION.to_string(),
            spec.conversation_id.clone(),
        );
        labels.insert(LABEL_CREATED_AT.to_string(), spec.created_at_ms.to_string());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            env: Some(env),
            working_dir: Some(SANDBOX_WORKSPACE_MOUNT.to_string()),
            host_config: Some(self.build_host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Self::container_name(&spec.name),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .with_context(|| format!("Failed to create sandbox '{}'", spec.name))?;

        info!(
            name = %spec.name,
            container = %&response.id[..12.min(response.id.len())],
            "created sandbox"
        );

        Ok(RuntimeSandbox {
            sandbox_id: response.id,
            name: spec.name.clone(),
            conversation_id: spec.conversation_id.clone(),
            created_at_ms: spec.created_at_ms,
            agent_endpoint: spec.agent_endpoint(),
            running: false,
        })
    }

    async fn start(&self, sandbox_id: &str) -> Result<()> {
        self.client
            .start_container(sandbox_id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start sandbox {sandbox_id}"))?;
        Ok(())
    }

    async fn wait_ready(&self, endpoint: &TransportEndpoint, timeout: Duration) -> Result<()> {
        poll_until_ready(&self.agent_probe, endpoint, timeout).await
    }

    async fn probe(&self, endpoint: &TransportEndpoint) -> bool {
        self.agent_probe.health(endpoint).await
    }

    async fn destroy(&self, sandbox_id: &str, grace: Duration) -> Result<()> {
        let stop = self
            .client
            .stop_container(
                sandbox_id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await;
        if let Err(e) = stop {
            debug!(sandbox_id, "graceful stop failed, forcing removal: {e}");
        }

        self.client
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove sandbox {sandbox_id}"))?;

        info!(sandbox_id, "destroyed sandbox");
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        let exec = self
            .client
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(String::as_str).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(SANDBOX_WORKSPACE_MOUNT),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut output = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?
        {
            let collect = async {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(sandbox_id, "exec stream error: {e}");
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(timeout, collect).await.is_err() {
                return Ok(ExecOutcome {
                    exit_code: -1,
                    output: format!("{output}\n[exec timed out after {timeout:?}]"),
                });
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn exec_binary(
        &self,
        sandbox_id: &str,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<(i64, Vec<u8>)> {
        let exec = self
            .client
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(String::as_str).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(false),
                    working_dir: Some(SANDBOX_WORKSPACE_MOUNT),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut bytes = Vec::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?
        {
            let collect = async {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(LogOutput::StdOut { message }) => bytes.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(sandbox_id, "exec stream error: {e}");
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(timeout, collect).await.is_err() {
                return Ok((-1, bytes));
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;
        Ok((inspect.exit_code.unwrap_or(-1), bytes))
    }

    async fn list(&self) -> Result<Vec<RuntimeSandbox>> {
        let mut filters = HashMap::new();
        filters.insert("label", vec!["workspace=true"]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list sandboxes")?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                Some(self.sandbox_from_labels(
                    id,
                    container.names.unwrap_or_default(),
                    container.labels.unwrap_or_default(),
                    container.state,
                ))
            })
            .collect())
    }

    async fn logs(&self, sandbox_id: &str, tail: usize) -> Result<String> {
        let mut stream = self.client.logs(
            sandbox_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => output.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => {
                    debug!(sandbox_id, "log fetch error: {e}");
                    break;
                }
            }
        }
        Ok(output)
    }

    async fn ping(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}
