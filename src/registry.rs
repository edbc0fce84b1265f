//! Module Registry
//!
//! Holds module implementations keyed by name and resolves DAG module
//! nodes to callables. The engine treats a module as opaque apart from its
//! declared `consumes`/`produces` signature, its config, and an async body
//! `(input record) -> outcome`.
//!
//! On every registration change the registry recomputes its **registry
//! hash**: SHA-256 over the ordered set of
//! `(name, major, minor, consumes signature, produces signature)` tuples.
//! The pipeline store's syntactic index keys on it, so a changed module
//! set forces recompilation even for byte-identical sources.

use crate::dag::{ComponentMetadata, DagSpec, HttpConfig, ModuleConfig, PipelineImage};
use crate::engine::cancel::CancelHandle;
use crate::value::{CType, RawValue};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Context passed to every module invocation.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Cooperative cancellation token; check between significant operations
    pub cancel: CancelHandle,
    /// Which attempt this is, starting at 1
    pub attempt: u32,
}

/// What a module body produced.
#[derive(Debug)]
pub enum ModuleOutcome {
    /// The declared output record
    Completed(HashMap<String, RawValue>),
    /// The module cannot make progress yet; the execution suspends so the
    /// caller can supply more data and resume
    Pending,
}

/// A failed module invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ModuleFailure {
    pub message: String,
    /// Whether a retry could plausibly succeed
    pub retriable: bool,
}

impl ModuleFailure {
    pub fn retriable(message: impl Into<String>) -> Self {
        ModuleFailure {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ModuleFailure {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Result of one module invocation.
pub type ModuleResult = Result<ModuleOutcome, ModuleFailure>;

/// An opaque async module body.
pub trait ModuleBody: Send + Sync {
    fn call(
        &self,
        inputs: HashMap<String, RawValue>,
        ctx: CallContext,
    ) -> BoxFuture<'static, ModuleResult>;
}

/// Wrap an async closure as a module body.
///
/// The closure must be `'static` because invocations outlive the borrow
/// of the registry that produced them.
pub fn module_fn<F, Fut>(f: F) -> Arc<dyn ModuleBody>
where
    F: Fn(HashMap<String, RawValue>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ModuleResult> + Send + 'static,
{
    struct FnBody<F>(F);
    impl<F, Fut> ModuleBody for FnBody<F>
    where
        F: Fn(HashMap<String, RawValue>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ModuleResult> + Send + 'static,
    {
        fn call(
            &self,
            inputs: HashMap<String, RawValue>,
            ctx: CallContext,
        ) -> BoxFuture<'static, ModuleResult> {
            Box::pin((self.0)(inputs, ctx))
        }
    }
    Arc::new(FnBody(f))
}

/// A registered module: declared signature plus body.
#[derive(Clone)]
pub struct ModuleDefinition {
    pub metadata: ComponentMetadata,
    pub consumes: Vec<(String, CType)>,
    pub produces: Vec<(String, CType)>,
    pub config: ModuleConfig,
    pub http_config: Option<HttpConfig>,
    pub body: Arc<dyn ModuleBody>,
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.metadata.name)
            .field("major", &self.metadata.major)
            .field("minor", &self.metadata.minor)
            .finish()
    }
}

impl ModuleDefinition {
    fn signature_tuple(&self) -> String {
        let consumes: Vec<String> = self
            .consumes
            .iter()
            .map(|(n, t)| format!("{}:{}", n, t.signature()))
            .collect();
        let produces: Vec<String> = self
            .produces
            .iter()
            .map(|(n, t)| format!("{}:{}", n, t.signature()))
            .collect();
        format!(
            "{}|{}|{}|({})|({})",
            self.metadata.name,
            self.metadata.major,
            self.metadata.minor,
            consumes.join(","),
            produces.join(",")
        )
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A DAG module node has no registered implementation
    #[error("Module '{0}' is not registered")]
    ModuleNotFound(String),
}

/// Thread-safe module registry.
pub struct ModuleRegistry {
    modules: DashMap<String, Arc<ModuleDefinition>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: DashMap::new(),
        }
    }

    /// Register (or replace) a module under its metadata name.
    pub fn register(&self, module: ModuleDefinition) {
        tracing::debug!(module = %module.metadata.name, "module_registered");
        self.modules
            .insert(module.metadata.name.clone(), Arc::new(module));
    }

    /// Remove a module; returns whether it existed.
    pub fn deregister(&self, name: &str) -> bool {
        self.modules.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleDefinition>> {
        self.modules.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// All registered modules, name-ordered.
    pub fn list_modules(&self) -> Vec<Arc<ModuleDefinition>> {
        let mut out: Vec<Arc<ModuleDefinition>> = self
            .modules
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out
    }

    /// Modules whose HTTP config marks them published.
    pub fn published_modules(&self) -> Vec<Arc<ModuleDefinition>> {
        self.list_modules()
            .into_iter()
            .filter(|m| m.http_config.as_ref().is_some_and(|h| h.published))
            .collect()
    }

    /// SHA-256 over the ordered registered signatures.
    pub fn registry_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for module in self.list_modules() {
            hasher.update(module.signature_tuple().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Resolve one module node to a callable body by its metadata name.
    pub fn resolve_body(
        &self,
        node: &crate::dag::ModuleNodeSpec,
    ) -> Result<Arc<dyn ModuleBody>, RegistryError> {
        self.get(&node.metadata.name)
            .map(|def| Arc::clone(&def.body))
            .ok_or_else(|| RegistryError::ModuleNotFound(node.metadata.name.clone()))
    }

    /// Resolve every module node of a DAG to a callable body.
    pub fn init_modules(
        &self,
        dag: &DagSpec,
    ) -> Result<HashMap<Uuid, Arc<dyn ModuleBody>>, RegistryError> {
        let mut out: HashMap<Uuid, Arc<dyn ModuleBody>> = HashMap::new();
        for (id, node) in &dag.modules {
            out.insert(*id, self.resolve_body(node)?);
        }
        Ok(out)
    }

    /// Wrap a stored image as an executable pipeline.
    ///
    /// Module bodies stay name-resolved at run time so a hot-swapped
    /// implementation takes effect without reloading the image.
    pub fn load(&self, image: Arc<PipelineImage>) -> Result<LoadedPipeline, RegistryError> {
        Ok(LoadedPipeline { image })
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A pipeline image ready to execute; module bodies resolve through the
/// registry at run time.
#[derive(Clone)]
pub struct LoadedPipeline {
    pub image: Arc<PipelineImage>,
}

impl std::fmt::Debug for LoadedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPipeline")
            .field("structural_hash", &self.image.structural_hash)
            .finish()
    }
}
