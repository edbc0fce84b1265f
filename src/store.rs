//! Pipeline Store
//!
//! Content-addressed storage of pipeline images.
//!
//! ## Design
//!
//! - Images are keyed by their structural hash; storing is idempotent and
//!   re-validates the embedded DAG, so a hand-built broken image never
//!   lands.
//! - Aliases are human names for hashes, updated with compare-and-set
//!   semantics; removal of an image is refused while aliases still point
//!   at it (no automatic cascade).
//! - The syntactic index maps `(syntactic hash, registry hash)` to a
//!   structural hash, letting the compiler skip recompilation when both
//!   the source text and the registered module set match a prior compile.
//!
//! All operations are atomic with respect to observers: images are stored
//! behind `Arc`, so a reader either sees nothing or the complete image.

use crate::dag::{structural_hash, validate_dag, DagValidationError, PipelineImage};
use dashmap::DashMap;
use std::sync::Arc;

/// Pipeline store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Alias or hash does not resolve
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Image removal refused while aliases reference it
    #[error("Pipeline {hash} is still aliased by: {}", aliases.join(", "))]
    StillAliased { hash: String, aliases: Vec<String> },

    /// The image's recorded hash disagrees with its DAG
    #[error("Image declares structural hash {declared} but its DAG hashes to {computed}")]
    HashMismatch { declared: String, computed: String },

    /// Embedded DAG failed validation
    #[error(transparent)]
    Validation(#[from] DagValidationError),

    /// Alias compare-and-set lost the race
    #[error("Alias '{alias}' changed concurrently (expected {expected:?})")]
    AliasConflict {
        alias: String,
        expected: Option<String>,
    },
}

/// Summary row for [`PipelineStore::list_images`].
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub structural_hash: String,
    pub name: String,
    pub compiled_at: chrono::DateTime<chrono::Utc>,
    pub module_count: usize,
    pub data_count: usize,
}

/// In-memory content-addressed pipeline store.
pub struct PipelineStore {
    images: DashMap<String, Arc<PipelineImage>>,
    /// alias -> structural hash
    aliases: DashMap<String, String>,
    /// (syntactic hash, registry hash) -> structural hash
    syntactic_index: DashMap<(String, String), String>,
}

impl PipelineStore {
    pub fn new() -> Self {
        PipelineStore {
            images: DashMap::new(),
            aliases: DashMap::new(),
            syntactic_index: DashMap::new(),
        }
    }

    /// Persist an image keyed by its structural hash.
    ///
    /// Validates the embedded DAG and recomputes the hash; idempotent for
    /// an image that is already present.
    pub fn store(&self, image: PipelineImage) -> Result<String, StoreError> {
        validate_dag(&image.dag_spec)?;
        let computed = structural_hash(&image.dag_spec, &image.module_options);
        if computed != image.structural_hash {
            return Err(StoreError::HashMismatch {
                declared: image.structural_hash,
                computed,
            });
        }
        let hash = image.structural_hash.clone();
        self.images.entry(hash.clone()).or_insert_with(|| {
            tracing::debug!(structural_hash = %hash, pipeline = %image.dag_spec.metadata.name, "pipeline_stored");
            Arc::new(image)
        });
        Ok(hash)
    }

    pub fn get(&self, hash: &str) -> Option<Arc<PipelineImage>> {
        self.images.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    /// Point an alias at a stored image (upsert).
    pub fn alias(&self, name: &str, hash: &str) -> Result<(), StoreError> {
        if !self.images.contains_key(hash) {
            return Err(StoreError::PipelineNotFound(hash.to_string()));
        }
        self.aliases.insert(name.to_string(), hash.to_string());
        Ok(())
    }

    /// Compare-and-set an alias: succeeds only if the alias currently
    /// resolves to `expected` (`None` = alias must not exist yet).
    pub fn compare_and_set_alias(
        &self,
        name: &str,
        expected: Option<&str>,
        hash: &str,
    ) -> Result<(), StoreError> {
        if !self.images.contains_key(hash) {
            return Err(StoreError::PipelineNotFound(hash.to_string()));
        }
        // The entry API holds the shard lock across the check-and-write,
        // which is what makes this a CAS rather than a racy read-then-set.
        match self.aliases.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => match expected {
                Some(e) if entry.get() == e => {
                    entry.insert(hash.to_string());
                    Ok(())
                }
                _ => Err(StoreError::AliasConflict {
                    alias: name.to_string(),
                    expected: expected.map(str::to_string),
                }),
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => match expected {
                None => {
                    entry.insert(hash.to_string());
                    Ok(())
                }
                Some(_) => Err(StoreError::AliasConflict {
                    alias: name.to_string(),
                    expected: expected.map(str::to_string),
                }),
            },
        }
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.aliases.get(name).map(|entry| entry.value().clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<PipelineImage>> {
        self.resolve(name).and_then(|hash| self.get(&hash))
    }

    /// All aliases as (name, structural hash), name-ordered.
    pub fn list_aliases(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .aliases
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// Drop an alias; returns whether it existed.
    pub fn unalias(&self, name: &str) -> bool {
        self.aliases.remove(name).is_some()
    }

    /// Remove an image. Refuses while aliases still point at it; returns
    /// `false` when the hash was never stored.
    pub fn remove(&self, hash: &str) -> Result<bool, StoreError> {
        let pointing: Vec<String> = self
            .aliases
            .iter()
            .filter(|entry| entry.value() == hash)
            .map(|entry| entry.key().clone())
            .collect();
        if !pointing.is_empty() {
            return Err(StoreError::StillAliased {
                hash: hash.to_string(),
                aliases: pointing,
            });
        }
        Ok(self.images.remove(hash).is_some())
    }

    /// Record that compiling `syntactic_hash` under `registry_hash`
    /// produced `structural_hash`.
    pub fn index_syntactic(&self, syntactic_hash: &str, registry_hash: &str, structural: &str) {
        self.syntactic_index.insert(
            (syntactic_hash.to_string(), registry_hash.to_string()),
            structural.to_string(),
        );
    }

    /// Look up a prior compile of the same source under the same module
    /// set.
    pub fn lookup_syntactic(&self, syntactic_hash: &str, registry_hash: &str) -> Option<String> {
        self.syntactic_index
            .get(&(syntactic_hash.to_string(), registry_hash.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Summaries of all stored images, hash-ordered.
    pub fn list_images(&self) -> Vec<ImageSummary> {
        let mut out: Vec<ImageSummary> = self
            .images
            .iter()
            .map(|entry| {
                let image = entry.value();
                ImageSummary {
                    structural_hash: entry.key().clone(),
                    name: image.dag_spec.metadata.name.clone(),
                    compiled_at: image.compiled_at,
                    module_count: image.dag_spec.modules.len(),
                    data_count: image.dag_spec.data.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.structural_hash.cmp(&b.structural_hash));
        out
    }
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ComponentMetadata, DagSpec, DataNodeSpec, InlineTransform, PipelineImage};
    use crate::value::{CType, CValue};
    use std::collections::HashMap;
    use uuid::Uuid;

    /// Single constant data node bound to one declared output.
    fn constant_image(name: &str, value: i64) -> PipelineImage {
        let mut dag = DagSpec::new(ComponentMetadata::new(name, 1, 0));
        let out = Uuid::new_v4();
        dag.data.insert(
            out,
            DataNodeSpec::new("answer", CType::Int).with_transform(
                InlineTransform::Constant {
                    value: CValue::Int(value),
                },
                vec![],
            ),
        );
        dag.declared_outputs.push("answer".to_string());
        dag.output_bindings.insert("answer".to_string(), out);
        PipelineImage::build(dag, HashMap::new(), Some(name.as_bytes()))
            .expect("valid test image")
    }

    #[test]
    fn test_store_and_get_idempotent() {
        let store = PipelineStore::new();
        let image = constant_image("p", 42);
        let hash = store.store(image.clone()).unwrap();
        let again = store.store(image).unwrap();
        assert_eq!(hash, again);
        assert!(store.get(&hash).is_some());
        assert_eq!(store.list_images().len(), 1);
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let store = PipelineStore::new();
        let mut image = constant_image("p", 42);
        image.structural_hash = "deadbeef".to_string();
        assert!(matches!(
            store.store(image),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_alias_resolution() {
        let store = PipelineStore::new();
        let hash = store.store(constant_image("p", 42)).unwrap();
        store.alias("prod", &hash).unwrap();
        assert_eq!(store.resolve("prod"), Some(hash.clone()));
        assert!(store.get_by_name("prod").is_some());
        assert!(store.resolve("staging").is_none());
        assert!(matches!(
            store.alias("broken", "unknown-hash"),
            Err(StoreError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_compare_and_set_alias() {
        let store = PipelineStore::new();
        let h1 = store.store(constant_image("p", 1)).unwrap();
        let h2 = store.store(constant_image("q", 2)).unwrap();

        store.compare_and_set_alias("prod", None, &h1).unwrap();
        // Stale expectation loses.
        assert!(matches!(
            store.compare_and_set_alias("prod", None, &h2),
            Err(StoreError::AliasConflict { .. })
        ));
        store.compare_and_set_alias("prod", Some(&h1), &h2).unwrap();
        assert_eq!(store.resolve("prod"), Some(h2));
    }

    #[test]
    fn test_remove_refused_while_aliased() {
        let store = PipelineStore::new();
        let hash = store.store(constant_image("p", 42)).unwrap();
        store.alias("prod", &hash).unwrap();
        assert!(matches!(
            store.remove(&hash),
            Err(StoreError::StillAliased { .. })
        ));
        store.unalias("prod");
        assert!(store.remove(&hash).unwrap());
        assert!(!store.remove(&hash).unwrap());
    }

    #[test]
    fn test_syntactic_index_round_trip() {
        let store = PipelineStore::new();
        let hash = store.store(constant_image("p", 42)).unwrap();
        store.index_syntactic("syn", "reg", &hash);
        assert_eq!(store.lookup_syntactic("syn", "reg"), Some(hash));
        assert_eq!(store.lookup_syntactic("syn", "other-reg"), None);
        assert_eq!(store.lookup_syntactic("other-syn", "reg"), None);
    }
}
