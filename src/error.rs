//! Error taxonomy for the workspace isolation core.
//!
//! Every failure class that can cross a component boundary has a stable
//! machine-readable code. The orchestrator converts these into terminal
//! SSE `error` events; the proxy maps them onto HTTP status codes.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the control plane.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Container-runtime API failure that may succeed on retry.
    #[error("container runtime failure: {0}")]
    TransientRuntime(String),

    /// Sandbox creation gave up after all retry attempts.
    #[error("sandbox creation failed after {attempts} attempts: {reason}")]
    CreateFailed { attempts: u32, reason: String },

    /// Warm pool had no usable entry. Falls through to on-demand
    /// creation; never user-facing on its own.
    #[error("warm pool exhausted")]
    PoolExhausted,

    /// Sandbox failed its liveness probe.
    #[error("sandbox {sandbox_id} failed its health probe")]
    SandboxUnhealthy { sandbox_id: String },

    /// The agent connection dropped or the event stream went idle
    /// past the stream timeout.
    #[error("agent connection lost: {0}")]
    AgentDisconnect(String),

    /// Proxy rejected an egress request for a non-allow-listed host.
    #[error("egress denied for host {host}")]
    EgressDenied { host: String },

    /// A host matched the signing policy but no credential material
    /// is loaded. The message never includes the secret.
    #[error("request signing unavailable for host {host}")]
    SigningMisconfigured { host: String },

    /// Object store errors; file sync skips with a warning.
    #[error("object store unavailable: {0}")]
    ObjectStoreUnavailable(String),

    /// Registry (KV) errors.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// New turns are rejected while draining.
    #[error("control plane is shutting down")]
    ShuttingDown,

    /// The per-turn deadline elapsed.
    #[error("turn exceeded execution timeout of {0:?}")]
    ExecutionTimeout(Duration),

    /// The conversation id was empty or malformed.
    #[error("invalid conversation id: {0:?}")]
    InvalidConversation(String),
}

impl WorkspaceError {
    /// Stable machine-readable code carried in terminal SSE `error`
    /// events and proxy denial bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WorkspaceError::TransientRuntime(_) => "transient-runtime",
            WorkspaceError::CreateFailed { .. } => "create-failed",
            WorkspaceError::PoolExhausted => "pool-exhausted",
            WorkspaceError::SandboxUnhealthy { .. } => "sandbox-unhealthy",
            WorkspaceError::AgentDisconnect(_) => "agent-disconnect",
            WorkspaceError::EgressDenied { .. } => "egress-denied",
            WorkspaceError::SigningMisconfigured { .. } => "signing-misconfigured",
            WorkspaceError::ObjectStoreUnavailable(_) => "object-store-unavailable",
            WorkspaceError::RegistryUnavailable(_) => "registry-unavailable",
            WorkspaceError::ShuttingDown => "shutting-down",
            WorkspaceError::ExecutionTimeout(_) => "execution-timeout",
            WorkspaceError::InvalidConversation(_) => "invalid-conversation",
        }
    }

    /// Whether the current turn should retry on a fresh sandbox.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkspaceError::AgentDisconnect(_) | WorkspaceError::SandboxUnhealthy { .. }
        )
    }
}
