//! Broker State Store
//!
//! Instance and binding bookkeeping held in memory and flushed as a single
//! JSON snapshot. The file backend writes the snapshot atomically and
//! restores it on startup; the in-memory backend keeps nothing across
//! restarts.

use crate::domain::ports::BrokerStore;
use crate::domain::records::{BindingRecord, InstanceRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Snapshot file name inside the data directory
pub const STATE_FILE_NAME: &str = "k8s-services.json";

// =============================================================================
// Store Configuration
// =============================================================================

/// Backend type for the state store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Nothing survives a restart
    InMemory,
    /// JSON snapshot at `path`
    FileSystem { path: PathBuf },
}

impl StoreBackend {
    /// File backend using the standard snapshot name inside `data_dir`
    pub fn in_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        StoreBackend::FileSystem {
            path: data_dir.into().join(STATE_FILE_NAME),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    instances: BTreeMap<String, InstanceRecord>,
    #[serde(default)]
    bindings: BTreeMap<String, BindingRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// [`BrokerStore`] keeping records in memory and flushing them as a snapshot
pub struct SnapshotStore {
    backend: StoreBackend,
    state: RwLock<StoreSnapshot>,
}

impl SnapshotStore {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            state: RwLock::new(StoreSnapshot::default()),
        }
    }

    /// Store that keeps nothing across restarts
    pub fn in_memory() -> Self {
        Self::new(StoreBackend::InMemory)
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    pub fn binding_count(&self) -> usize {
        self.state.read().bindings.len()
    }

    /// Time of the last successful flush
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().saved_at
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl BrokerStore for SnapshotStore {
    async fn restore(&self) -> Result<()> {
        let path = match &self.backend {
            StoreBackend::InMemory => return Ok(()),
            StoreBackend::FileSystem { path } => path,
        };

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No state snapshot found, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: StoreSnapshot = serde_json::from_slice(&content).map_err(|e| {
            Error::Persistence(format!("corrupt snapshot {}: {}", path.display(), e))
        })?;

        info!(
            path = %path.display(),
            instances = snapshot.instances.len(),
            bindings = snapshot.bindings.len(),
            "State snapshot restored"
        );
        *self.state.write() = snapshot;
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let path = match &self.backend {
            StoreBackend::InMemory => {
                self.state.write().saved_at = Some(Utc::now());
                return Ok(());
            }
            StoreBackend::FileSystem { path } => path,
        };

        let now = Utc::now();
        let content = {
            let mut snapshot = self.state.read().clone();
            snapshot.saved_at = Some(now);
            serde_json::to_vec_pretty(&snapshot)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content).await.map_err(|e| {
            warn!(path = %tmp.display(), "Failed to write state snapshot: {}", e);
            Error::Persistence(format!("write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            Error::Persistence(format!("rename {}: {}", path.display(), e))
        })?;

        self.state.write().saved_at = Some(now);
        debug!(path = %path.display(), bytes = content.len(), "State snapshot saved");
        Ok(())
    }

    async fn create_instance_details(&self, instance_id: &str, record: InstanceRecord) -> Result<()> {
        self.state
            .write()
            .instances
            .insert(instance_id.to_string(), record);
        Ok(())
    }

    async fn retrieve_instance_details(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.state.read().instances.get(instance_id).cloned())
    }

    async fn delete_instance_details(&self, instance_id: &str) -> Result<()> {
        self.state.write().instances.remove(instance_id);
        Ok(())
    }

    async fn is_instance_conflict(&self, instance_id: &str, record: &InstanceRecord) -> bool {
        self.state
            .read()
            .instances
            .get(instance_id)
            .map_or(false, |existing| existing.conflicts_with(record))
    }

    async fn create_binding_details(&self, binding_id: &str, record: BindingRecord) -> Result<()> {
        self.state
            .write()
            .bindings
            .insert(binding_id.to_string(), record);
        Ok(())
    }

    async fn retrieve_binding_details(&self, binding_id: &str) -> Result<Option<BindingRecord>> {
        Ok(self.state.read().bindings.get(binding_id).cloned())
    }

    async fn delete_binding_details(&self, binding_id: &str) -> Result<()> {
        self.state.write().bindings.remove(binding_id);
        Ok(())
    }

    async fn is_binding_conflict(&self, binding_id: &str, record: &BindingRecord) -> bool {
        self.state
            .read()
            .bindings
            .get(binding_id)
            .map_or(false, |existing| existing != record)
    }
}
