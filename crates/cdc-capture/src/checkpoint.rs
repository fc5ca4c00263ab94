//! Resume position storage strategies
//!
//! The subscriber keeps the authoritative position in memory. A store only
//! mirrors every committed position so a restarted process resumes where the
//! last one stopped.

use async_trait::async_trait;
use cdc_core::prelude::*;
use cdc_core::{CheckpointConfig, CheckpointStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Checkpoint storage trait (Strategy pattern)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last committed position
    async fn load(&self) -> Result<ResumePosition>;

    /// Save a committed position
    async fn save(&self, position: &ResumePosition) -> Result<()>;

    /// Get store name
    fn name(&self) -> &'static str;
}

/// Build the configured store for one namespace
pub fn checkpoint_for(
    config: &CheckpointConfig,
    namespace: &Namespace,
) -> Arc<dyn CheckpointStore> {
    match config.storage_type {
        CheckpointStorage::Memory => Arc::new(MemoryCheckpoint::new()),
        CheckpointStorage::File => {
            let path = PathBuf::from(&config.path).join(format!("{}.checkpoint.json", namespace));
            Arc::new(FileCheckpoint::new(path))
        }
    }
}

// ============================================================================
// File-based Checkpoint
// ============================================================================

/// On-disk checkpoint record
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    resume_token: Option<ResumeToken>,
    updated_at: DateTime<Utc>,
}

/// File-based checkpoint storage
pub struct FileCheckpoint {
    path: PathBuf,
    cached: RwLock<Option<ResumePosition>>,
}

impl FileCheckpoint {
    /// Create new file checkpoint
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<ResumePosition> {
        match fs::read(&self.path).await {
            Ok(content) => {
                let file: CheckpointFile = serde_json::from_slice(&content)
                    .map_err(|e| CdcError::checkpoint("Failed to parse checkpoint", e))?;
                let position = match file.resume_token {
                    Some(token) => ResumePosition::after(token),
                    None => ResumePosition::start(),
                };
                *self.cached.write().await = Some(position.clone());
                info!(position = %position, path = ?self.path, "Loaded checkpoint");
                Ok(position)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No checkpoint file, starting from the live tail");
                Ok(ResumePosition::start())
            }
            Err(e) => Err(CdcError::checkpoint("Failed to read checkpoint", e)),
        }
    }

    async fn save(&self, position: &ResumePosition) -> Result<()> {
        // Only write if changed
        if self.cached.read().await.as_ref() == Some(position) {
            return Ok(());
        }

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CdcError::checkpoint("Failed to create checkpoint directory", e))?;
        }

        let body = serde_json::to_vec(&CheckpointFile {
            resume_token: position.token().cloned(),
            updated_at: Utc::now(),
        })?;

        // Write atomically via temp file
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, body)
            .await
            .map_err(|e| CdcError::checkpoint("Failed to write checkpoint", e))?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CdcError::checkpoint("Failed to rename checkpoint", e))?;

        *self.cached.write().await = Some(position.clone());
        debug!(position = %position, "Saved checkpoint");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file_checkpoint"
    }
}

// ============================================================================
// Memory Checkpoint
// ============================================================================

/// In-memory checkpoint storage; positions do not survive a restart
pub struct MemoryCheckpoint {
    position: RwLock<ResumePosition>,
}

impl MemoryCheckpoint {
    /// Create new memory checkpoint
    pub fn new() -> Self {
        Self::with_position(ResumePosition::start())
    }

    /// Create with initial value
    pub fn with_position(position: ResumePosition) -> Self {
        Self {
            position: RwLock::new(position),
        }
    }
}

impl Default for MemoryCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<ResumePosition> {
        Ok(self.position.read().await.clone())
    }

    async fn save(&self, position: &ResumePosition) -> Result<()> {
        *self.position.write().await = position.clone();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_checkpoint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_checkpoint() {
        let cp = MemoryCheckpoint::new();

        assert!(cp.load().await.unwrap().is_start());
        cp.save(&ResumePosition::after(ResumeToken::new("t7"))).await.unwrap();
        assert_eq!(
            cp.load().await.unwrap().token(),
            Some(&ResumeToken::new("t7"))
        );
    }

    #[tokio::test]
    async fn test_file_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("etl_db.orders.checkpoint.json");

        let cp = FileCheckpoint::new(&path);

        // Missing file means start from the live tail
        assert!(cp.load().await.unwrap().is_start());

        let token = ResumeToken::new(r#"{"_data":"8263A1F2"}"#);
        cp.save(&ResumePosition::after(token.clone())).await.unwrap();
        assert_eq!(cp.load().await.unwrap().token(), Some(&token));

        // New instance should load persisted value
        let cp2 = FileCheckpoint::new(&path);
        assert_eq!(cp2.load().await.unwrap().token(), Some(&token));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = FileCheckpoint::new(&path).load().await.unwrap_err();
        assert!(matches!(err, CdcError::Checkpoint { .. }));
    }

    #[test]
    fn test_factory_names_file_per_namespace() {
        let config = CheckpointConfig {
            storage_type: CheckpointStorage::File,
            path: "/tmp/cdc".into(),
        };
        let store = checkpoint_for(&config, &Namespace::new("etl_db", "orders"));
        assert_eq!(store.name(), "file_checkpoint");

        let store = checkpoint_for(&CheckpointConfig::default(), &Namespace::new("a", "b"));
        assert_eq!(store.name(), "memory_checkpoint");
    }
}
