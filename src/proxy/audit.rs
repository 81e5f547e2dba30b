//! Egress audit logging.
//!
//! Every proxy decision worth keeping is appended to a JSONL file:
//! denials always, forwards and tunnels when `log_all_requests` is on.
//! Default location: ~/.workspaced/egress.jsonl

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// Egress event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EgressEvent {
    /// Request rejected by the allow-list; no bytes were forwarded.
    Denied { host: String, reason: String },
    /// Forward HTTP request relayed upstream.
    Forwarded {
        host: String,
        method: String,
        status: u16,
        signed: bool,
    },
    /// CONNECT tunnel closed.
    Tunneled {
        host: String,
        bytes_up: u64,
        bytes_down: u64,
    },
    /// Admin surface swapped the rule set.
    RulesUpdated { allow_patterns: usize, mcp_rules: usize },
}

/// A logged audit entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressEntry {
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Sandbox the request originated from
    pub sandbox_id: String,
    /// Per-sandbox credential nonce, when material was issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// The event
    #[serde(flatten)]
    pub event: EgressEvent,
}

impl EgressEntry {
    pub fn new(sandbox_id: &str, nonce: Option<String>, event: EgressEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            sandbox_id: sandbox_id.to_string(),
            nonce,
            event,
        }
    }
}

/// Get the default egress audit log path
pub fn default_audit_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".workspaced")
        .join("egress.jsonl")
}

/// Egress audit logger, shared by every proxy instance.
pub struct EgressAudit {
    path: PathBuf,
    log_all: bool,
}

impl EgressAudit {
    /// Create a logger at the configured path; empty means the default.
    pub fn new(path: &str, log_all: bool) -> Self {
        let path = if path.is_empty() {
            default_audit_path()
        } else {
            PathBuf::from(path)
        };
        Self { path, log_all }
    }

    /// Create with a custom path, logging everything.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            log_all: true,
        }
    }

    /// Log an egress event. Denials and rule updates are always kept;
    /// forwards and tunnels only when `log_all_requests` is set.
    pub fn log(&self, entry: EgressEntry) -> Result<()> {
        let keep = match entry.event {
            EgressEvent::Denied { .. } | EgressEvent::RulesUpdated { .. } => true,
            EgressEvent::Forwarded { .. } | EgressEvent::Tunneled { .. } => self.log_all,
        };
        if !keep {
            return Ok(());
        }

        let line = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read all audit entries
    pub fn read_all(&self) -> Result<Vec<EgressEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("skipping malformed audit entry: {e}"),
            }
        }

        Ok(entries)
    }

    /// Read entries filtered by sandbox id
    pub fn read_by_sandbox(&self, sandbox_id: &str) -> Result<Vec<EgressEntry>> {
        let entries = self.read_all()?;
        Ok(entries
            .into_iter()
            .filter(|e| e.sandbox_id == sandbox_id)
            .collect())
    }

    /// Read entries filtered by destination host
    pub fn read_by_host(&self, host: &str) -> Result<Vec<EgressEntry>> {
        let entries = self.read_all()?;
        Ok(entries
            .into_iter()
            .filter(|e| match &e.event {
                EgressEvent::Denied { host: h, .. }
                | EgressEvent::Forwarded { host: h, .. }
                | EgressEvent::Tunneled { host: h, .. } => h == host,
                EgressEvent::RulesUpdated { .. } => false,
            })
            .collect())
    }

    /// Get the log path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
