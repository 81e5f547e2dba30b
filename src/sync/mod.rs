//! Bidirectional file sync between the object store and a sandbox
//! workspace directory.
//!
//! Sync-in runs before every turn; sync-out runs at the end of a turn
//! and, debounced, after each observed `tool_result`. The object store
//! is the source of truth: a replacement sandbox restores its workspace
//! entirely through sync-in.

pub mod debounce;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::BlobStore;

/// Reserved key segment holding sync metadata, never treated as a
/// conversation file.
const META_DIR: &str = ".workspaced";

/// Who produced a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileSource {
    User,
    AgentCreated,
    AgentModified,
}

/// Per-path sync state; drives both directions of sync and attributes
/// AI-produced artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub source: FileSource,
    pub version: u64,
}

/// Last-synced state for one conversation, persisted next to the files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, FileDescriptor>,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub uploaded: usize,
    /// True when no object store is configured and the pass was a
    /// no-op.
    pub skipped: bool,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// SHA-256 hex digest used as the file checksum.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// File sync engine, shared across conversations.
pub struct FileSync {
    store: Option<Arc<dyn BlobStore>>,
    tenant: String,
}

impl FileSync {
    pub fn new(store: Option<Arc<dyn BlobStore>>, tenant: &str) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
        }
    }

    /// Whether a backend is configured at all.
    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    fn prefix(&self, conversation_id: &str) -> String {
        format!("{}/{}/", self.tenant, conversation_id)
    }

    fn manifest_key(&self, conversation_id: &str) -> String {
        format!("{}/{}/{META_DIR}/manifest.json", self.tenant, conversation_id)
    }

    async fn load_manifest(&self, store: &Arc<dyn BlobStore>, conversation_id: &str) -> Manifest {
        match store.get(&self.manifest_key(conversation_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(conversation_id, "malformed sync manifest, starting fresh: {e}");
                Manifest::default()
            }),
            Err(_) => Manifest::default(),
        }
    }

    async fn save_manifest(
        &self,
        store: &Arc<dyn BlobStore>,
        conversation_id: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        store
            .put(
                &self.manifest_key(conversation_id),
                serde_json::to_vec(manifest)?,
            )
            .await
    }

    /// Start-of-turn sync: fetch files the workspace is missing or that
    /// changed since the last sync, and record every fetched blob in
    /// the manifest (source `user` unless already tracked) so a later
    /// sync-out attributes only genuine agent writes. Skipped (not
    /// failed) when no store backend is configured.
    pub async fn sync_in(&self, conversation_id: &str, workspace_dir: &Path) -> Result<SyncReport> {
        let Some(store) = &self.store else {
            debug!(conversation_id, "no object store configured, skipping sync-in");
            return Ok(SyncReport::skipped());
        };

        tokio::fs::create_dir_all(workspace_dir)
            .await
            .with_context(|| format!("Failed to create workspace dir {}", workspace_dir.display()))?;

        let mut manifest = self.load_manifest(store, conversation_id).await;
        let prefix = self.prefix(conversation_id);
        let blobs = store
            .list(&prefix)
            .await
            .context("object store list failed during sync-in")?;

        let mut fetched = 0usize;
        let mut manifest_dirty = false;
        for blob in blobs {
            let Some(relative) = blob.key.strip_prefix(&prefix) else {
                continue;
            };
            if relative.starts_with(META_DIR) || relative.is_empty() {
                continue;
            }
            let relative = relative.to_string();
            let local_path = workspace_dir.join(&relative);
            let needs_fetch = match (
                tokio::fs::read(&local_path).await,
                manifest.files.get(&relative),
            ) {
                (Err(_), _) => true,
                // Untracked blob: the store is the source of truth,
                // whatever already sits at the path.
                (Ok(_), None) => true,
                // A listing size that disagrees with the manifest means
                // the blob changed in the store behind this sandbox.
                (Ok(existing), Some(descriptor)) => {
                    checksum(&existing) != descriptor.checksum || blob.size != descriptor.size
                }
            };
            if !needs_fetch {
                continue;
            }
            let data = store.get(&blob.key).await?;
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local_path, &data).await?;
            fetched += 1;

            let descriptor = match manifest.files.get(&relative) {
                Some(existing) => FileDescriptor {
                    path: relative.clone(),
                    size: data.len() as u64,
                    checksum: checksum(&data),
                    source: existing.source,
                    version: existing.version,
                },
                None => FileDescriptor {
                    path: relative.clone(),
                    size: data.len() as u64,
                    checksum: checksum(&data),
                    source: FileSource::User,
                    version: 1,
                },
            };
            if manifest.files.get(&relative) != Some(&descriptor) {
                manifest.files.insert(relative, descriptor);
                manifest_dirty = true;
            }
        }

        if manifest_dirty {
            self.save_manifest(store, conversation_id, &manifest).await?;
        }

        debug!(conversation_id, fetched, "sync-in complete");
        Ok(SyncReport {
            fetched,
            uploaded: 0,
            skipped: false,
        })
    }

    /// End-of-turn (and mid-run flush) sync: upload files whose
    /// checksum differs from the last-known manifest, attributing them
    /// as agent-created or agent-modified and bumping the per-path
    /// version.
    pub async fn sync_out(&self, conversation_id: &str, workspace_dir: &Path) -> Result<SyncReport> {
        let Some(store) = &self.store else {
            debug!(conversation_id, "no object store configured, skipping sync-out");
            return Ok(SyncReport::skipped());
        };

        let mut manifest = self.load_manifest(store, conversation_id).await;
        let prefix = self.prefix(conversation_id);

        let mut uploaded = 0usize;
        for (relative, path) in walk_files(workspace_dir).await? {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                // File vanished between walk and read; next flush
                // catches it.
                Err(_) => continue,
            };
            let sum = checksum(&data);
            let size = data.len() as u64;

            let descriptor = match manifest.files.get(&relative) {
                Some(existing) if existing.checksum == sum => continue,
                Some(existing) => FileDescriptor {
                    path: relative.clone(),
                    size,
                    checksum: sum,
                    source: FileSource::AgentModified,
                    version: existing.version + 1,
                },
                None => FileDescriptor {
                    path: relative.clone(),
                    size,
                    checksum: sum,
                    source: FileSource::AgentCreated,
                    version: 1,
                },
            };

            store.put(&format!("{prefix}{relative}"), data).await?;
            manifest.files.insert(relative, descriptor);
            uploaded += 1;
        }

        if uploaded > 0 {
            self.save_manifest(store, conversation_id, &manifest).await?;
        }

        debug!(conversation_id, uploaded, "sync-out complete");
        Ok(SyncReport {
            fetched: 0,
            uploaded,
            skipped: false,
        })
    }

    /// Seed the manifest for files uploaded on behalf of the user, so a
    /// later agent edit is attributed as a modification.
    pub async fn register_user_file(
        &self,
        conversation_id: &str,
        relative: &str,
        data: &[u8],
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut manifest = self.load_manifest(store, conversation_id).await;
        let version = manifest
            .files
            .get(relative)
            .map(|d| d.version + 1)
            .unwrap_or(1);
        store
            .put(&format!("{}{relative}", self.prefix(conversation_id)), data.to_vec())
            .await?;
        manifest.files.insert(
            relative.to_string(),
            FileDescriptor {
                path: relative.to_string(),
                size: data.len() as u64,
                checksum: checksum(data),
                source: FileSource::User,
                version,
            },
        );
        self.save_manifest(store, conversation_id, &manifest).await
    }
}

/// Recursively enumerate regular files under a directory as
/// `(relative-slash-path, absolute-path)` pairs, sorted for
/// deterministic upload order. The sync metadata directory is skipped.
async fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(_) => continue,
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            if relative.starts_with(META_DIR) {
                continue;
            }
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                files.insert(relative, path);
            }
        }
    }
    Ok(files.into_iter().collect())
}
