//! Artifact storage.
//!
//! The pipeline only needs `put`/`get`/`list_recent`; it is indifferent to
//! the backing medium. Ships an in-memory store and a file-backed store
//! (one JSON blob per artifact plus a recent-ids index), composed behind a
//! fallback wrapper so a successfully generated artifact is never lost to a
//! failing primary after a long stream.

use crate::constants::MAX_RECENT_ITEMS;
use crate::types::{CardforgeError, GeneratedArtifact, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, artifact: GeneratedArtifact) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<GeneratedArtifact>>;
    async fn list_recent(&self, limit: usize) -> Result<Vec<GeneratedArtifact>>;
}

/// --- IN-MEMORY STORE ---

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, GeneratedArtifact>,
    recent: VecDeque<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, artifact: GeneratedArtifact) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.recent.retain(|id| id != &artifact.id);
        inner.recent.push_front(artifact.id.clone());
        inner.recent.truncate(MAX_RECENT_ITEMS);
        inner.records.insert(artifact.id.clone(), artifact);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<GeneratedArtifact>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<GeneratedArtifact>> {
        let inner = self.inner.read().await;
        Ok(inner
            .recent
            .iter()
            .take(limit)
            .filter_map(|id| inner.records.get(id).cloned())
            .collect())
    }
}

/// --- FILE STORE ---

/// One `<id>.json` blob per artifact under `root/cards/`, plus a
/// `recent.json` index of the newest ids.
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the index file.
    index_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_lock: Mutex::new(()),
        }
    }

    fn card_path(&self, id: &str) -> PathBuf {
        self.root.join("cards").join(format!("{}.json", id))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("recent.json")
    }

    async fn read_index(&self) -> Vec<String> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> CardforgeError {
    CardforgeError::Storage(format!("{}: {}", context, e))
}

#[async_trait]
impl ContentStore for FileStore {
    async fn put(&self, artifact: GeneratedArtifact) -> Result<()> {
        let dir = self.root.join("cards");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("create card dir", e))?;

        let body = serde_json::to_vec_pretty(&artifact)?;
        tokio::fs::write(self.card_path(&artifact.id), body)
            .await
            .map_err(|e| storage_err("write card blob", e))?;

        let _guard = self.index_lock.lock().await;
        let mut ids = self.read_index().await;
        ids.retain(|id| id != &artifact.id);
        ids.insert(0, artifact.id.clone());
        ids.truncate(MAX_RECENT_ITEMS);
        let index_body = serde_json::to_vec(&ids)?;
        tokio::fs::write(self.index_path(), index_body)
            .await
            .map_err(|e| storage_err("write recent index", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<GeneratedArtifact>> {
        match tokio::fs::read(self.card_path(id)).await {
            Ok(bytes) => {
                let artifact = serde_json::from_slice(&bytes)?;
                Ok(Some(artifact))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read card blob", e).into()),
        }
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<GeneratedArtifact>> {
        let ids = self.read_index().await;
        let mut out = Vec::new();
        for id in ids.iter().take(limit) {
            if let Some(artifact) = self.get(id).await? {
                out.push(artifact);
            }
        }
        Ok(out)
    }
}

/// --- FALLBACK COMPOSITION ---

/// Writes go to the primary store; when that fails the artifact is parked in
/// an in-memory secondary instead of being dropped. Reads consult both.
pub struct FallbackStore {
    primary: Arc<dyn ContentStore>,
    secondary: MemoryStore,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn ContentStore>) -> Self {
        Self {
            primary,
            secondary: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl ContentStore for FallbackStore {
    async fn put(&self, artifact: GeneratedArtifact) -> Result<()> {
        match self.primary.put(artifact.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    "Primary store rejected artifact {}; falling back to memory: {}",
                    artifact.id,
                    e.inner
                );
                self.secondary.put(artifact).await
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<GeneratedArtifact>> {
        match self.primary.get(id).await {
            Ok(Some(a)) => Ok(Some(a)),
            Ok(None) => self.secondary.get(id).await,
            Err(e) => {
                tracing::warn!("Primary store get failed for {}: {}", id, e.inner);
                self.secondary.get(id).await
            }
        }
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<GeneratedArtifact>> {
        let mut merged = match self.primary.list_recent(limit).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Primary store list_recent failed: {}", e.inner);
                Vec::new()
            }
        };
        for fallback in self.secondary.list_recent(limit).await? {
            if !merged.iter().any(|a| a.id == fallback.id) {
                merged.push(fallback);
            }
        }
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged.truncate(limit);
        Ok(merged)
    }
}
