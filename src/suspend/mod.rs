//! Suspension Subsystem
//!
//! Serializable snapshots of in-flight executions, and the store that
//! persists, filters, lists and hands them back for resumption.
//!
//! ## Design
//!
//! A snapshot is self-contained: it embeds the DAG spec and module
//! options, so a pruned pipeline store cannot strand a suspended
//! execution. Values are stored typed (`CValue`); the codec writes them
//! as `{type, value}` pairs.
//!
//! The store is in-memory first with optional directory persistence:
//! snapshots written as files load lazily on `load`/`list`, which keeps
//! executions addressable across restarts.

pub mod codec;

pub use codec::{CodecError, JsonSuspensionCodec, SuspensionCodec};

use crate::dag::{DagSpec, ModuleCallOptions};
use crate::value::CValue;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Serializable snapshot of a partially-complete execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendedExecution {
    pub execution_id: String,
    pub structural_hash: String,
    /// Incremented by every successful resume
    pub resumption_count: u32,
    /// Embedded so resumption works even after store pruning
    pub dag_spec: DagSpec,
    pub module_options: HashMap<Uuid, ModuleCallOptions>,
    /// User inputs provided so far, by data-node name
    pub provided_inputs: HashMap<String, CValue>,
    /// Every resolved data node, typed
    pub computed_values: HashMap<Uuid, CValue>,
    /// Module statuses as string tags
    pub module_statuses: HashMap<Uuid, String>,
}

/// Filter for [`SuspensionStore::list`]; fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct SuspensionFilter {
    pub structural_hash: Option<String>,
    pub execution_id: Option<String>,
    pub min_resumption_count: Option<u32>,
    pub max_resumption_count: Option<u32>,
}

impl SuspensionFilter {
    fn matches(&self, snapshot: &SuspendedExecution) -> bool {
        if let Some(hash) = &self.structural_hash {
            if snapshot.structural_hash != *hash {
                return false;
            }
        }
        if let Some(id) = &self.execution_id {
            if snapshot.execution_id != *id {
                return false;
            }
        }
        if let Some(min) = self.min_resumption_count {
            if snapshot.resumption_count < min {
                return false;
            }
        }
        if let Some(max) = self.max_resumption_count {
            if snapshot.resumption_count > max {
                return false;
            }
        }
        true
    }
}

/// Listing row; omits the embedded DAG and computed values.
#[derive(Debug, Clone)]
pub struct SuspensionSummary {
    pub handle: String,
    pub execution_id: String,
    pub structural_hash: String,
    pub resumption_count: u32,
    pub pipeline_name: String,
    pub computed_count: usize,
}

/// Suspension store errors
#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot not found: {0}")]
    NotFound(String),
}

/// Store of suspended executions.
pub struct SuspensionStore {
    codec: Arc<dyn SuspensionCodec>,
    entries: DashMap<String, Arc<SuspendedExecution>>,
    data_dir: Option<PathBuf>,
}

impl SuspensionStore {
    /// In-memory store with the default JSON codec.
    pub fn new() -> Self {
        SuspensionStore {
            codec: Arc::new(JsonSuspensionCodec),
            entries: DashMap::new(),
            data_dir: None,
        }
    }

    /// Store persisting each snapshot as a file under `dir`.
    pub fn with_data_dir(dir: PathBuf) -> Result<Self, SuspendError> {
        std::fs::create_dir_all(&dir)?;
        Ok(SuspensionStore {
            codec: Arc::new(JsonSuspensionCodec),
            entries: DashMap::new(),
            data_dir: Some(dir),
        })
    }

    /// Swap the codec (e.g. for a compacting or encrypting variant).
    pub fn with_codec(mut self, codec: Arc<dyn SuspensionCodec>) -> Self {
        self.codec = codec;
        self
    }

    fn path_for(&self, handle: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{handle}.json")))
    }

    /// Persist a snapshot and return its handle.
    pub fn save(&self, snapshot: SuspendedExecution) -> Result<String, SuspendError> {
        let handle = Uuid::new_v4().to_string();
        if let Some(path) = self.path_for(&handle) {
            let bytes = self.codec.encode(&snapshot)?;
            std::fs::write(path, bytes)?;
        }
        tracing::debug!(
            handle = %handle,
            execution_id = %snapshot.execution_id,
            resumption_count = snapshot.resumption_count,
            "suspension_saved"
        );
        self.entries.insert(handle.clone(), Arc::new(snapshot));
        Ok(handle)
    }

    /// Load a snapshot; falls back to the data directory for handles not
    /// resident in memory.
    pub fn load(&self, handle: &str) -> Result<Option<Arc<SuspendedExecution>>, SuspendError> {
        if let Some(entry) = self.entries.get(handle) {
            return Ok(Some(Arc::clone(entry.value())));
        }
        let Some(path) = self.path_for(handle) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let snapshot = Arc::new(self.codec.decode(&bytes)?);
        self.entries.insert(handle.to_string(), Arc::clone(&snapshot));
        Ok(Some(snapshot))
    }

    /// Delete a snapshot; returns whether it existed.
    pub fn delete(&self, handle: &str) -> Result<bool, SuspendError> {
        let in_memory = self.entries.remove(handle).is_some();
        let on_disk = match self.path_for(handle) {
            Some(path) if path.exists() => {
                std::fs::remove_file(path)?;
                true
            }
            _ => false,
        };
        Ok(in_memory || on_disk)
    }

    /// List snapshot summaries matching a filter.
    pub fn list(&self, filter: &SuspensionFilter) -> Result<Vec<SuspensionSummary>, SuspendError> {
        self.hydrate_from_disk()?;
        let mut out: Vec<SuspensionSummary> = self
            .entries
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| {
                let s = entry.value();
                SuspensionSummary {
                    handle: entry.key().clone(),
                    execution_id: s.execution_id.clone(),
                    structural_hash: s.structural_hash.clone(),
                    resumption_count: s.resumption_count,
                    pipeline_name: s.dag_spec.metadata.name.clone(),
                    computed_count: s.computed_values.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(out)
    }

    /// Pull any snapshots present on disk but not yet in memory (written
    /// by a previous process).
    fn hydrate_from_disk(&self) -> Result<(), SuspendError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || self.entries.contains_key(stem)
            {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            match self.codec.decode(&bytes) {
                Ok(snapshot) => {
                    self.entries.insert(stem.to_string(), Arc::new(snapshot));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "snapshot_decode_failed");
                }
            }
        }
        Ok(())
    }
}

impl Default for SuspensionStore {
    fn default() -> Self {
        Self::new()
    }
}
