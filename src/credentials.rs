//! In-memory cloud credential material for signed egress.
//!
//! Credentials live exclusively in the control plane; they are injected
//! into upstream requests by the per-sandbox proxy and never written
//! into a sandbox's environment or filesystem. Rotation publishes a new
//! immutable snapshot; proxy handlers read the current snapshot once
//! per request.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::CredentialsConfig;

/// One set of signing material plus the per-sandbox nonce that ties
/// audit entries back to the sandbox the request left from.
#[derive(Debug, Clone)]
pub struct CredentialMaterial {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    /// Per-sandbox nonce, attached when the snapshot is issued to a
    /// proxy. Appears only in audit logs.
    pub nonce: String,
}

/// Base material shared by every sandbox; the nonce is filled in per
/// issue.
#[derive(Debug, Clone)]
struct BaseMaterial {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    region: String,
}

/// Hot-swappable credential holder. Single writer (the rotation task),
/// many readers (proxy request handlers).
pub struct CredentialStore {
    current: RwLock<Option<Arc<BaseMaterial>>>,
    signing_service: String,
}

impl CredentialStore {
    /// Create an empty store; signing requests fail with
    /// `signing-misconfigured` until material is rotated in.
    pub fn empty(signing_service: &str) -> Self {
        Self {
            current: RwLock::new(None),
            signing_service: signing_service.to_string(),
        }
    }

    /// Load initial material from the environment variables named in
    /// the configuration. Missing variables leave the store empty.
    pub async fn load_env(config: &CredentialsConfig) -> Self {
        let store = Self::empty(&config.signing_service);
        if let (Ok(access_key_id), Ok(secret_access_key)) = (
            std::env::var(&config.access_key_env),
            std::env::var(&config.secret_key_env),
        ) {
            store
                .rotate(
                    &access_key_id,
                    &secret_access_key,
                    std::env::var(&config.session_token_env).ok(),
                    &config.region,
                )
                .await;
        }
        store
    }

    /// Publish a new snapshot. Readers pick it up on their next issue.
    pub async fn rotate(
        &self,
        access_key_id: &str,
        secret_access_key: &str,
        session_token: Option<String>,
        region: &str,
    ) {
        let material = BaseMaterial {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token,
            region: region.to_string(),
        };
        *self.current.write().await = Some(Arc::new(material));
    }

    /// Drop the current material entirely.
    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    /// Whether any material is loaded.
    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// SigV4 service name used for hosts matching the signing policy.
    pub fn signing_service(&self) -> &str {
        &self.signing_service
    }

    /// Read the current snapshot and attach the caller's per-sandbox
    /// nonce. Returns None when no material is loaded.
    pub async fn issue(&self, nonce: &str) -> Option<CredentialMaterial> {
        let current = self.current.read().await;
        current.as_ref().map(|base| CredentialMaterial {
            access_key_id: base.access_key_id.clone(),
            secret_access_key: base.secret_access_key.clone(),
            session_token: base.session_token.clone(),
            region: base.region.clone(),
            nonce: nonce.to_string(),
        })
    }
}
