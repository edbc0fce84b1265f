//! Execution Engine
//!
//! The facade hosts talk to: module management, pipeline resolution,
//! `run`, `resume`, and the wiring between the store, registry, scheduler
//! and suspension subsystem.
//!
//! ## Execution lifecycle
//!
//! ```text
//! run(loaded, inputs, options)
//!     ├── validate + publish user inputs        (Input)
//!     ├── ExecutionDriver::drive()
//!     │     ├── inline transforms fire inline   (InlineTransform)
//!     │     ├── modules schedule by readiness   (Computed)
//!     │     └── quiesce -> complete | suspend | cancel
//!     └── DataSignature (+ SuspendedExecution when suspended)
//!
//! resume(snapshot, additional, resolved, options)
//!     ├── structural-hash check, overlap check, at-most-one resumer
//!     ├── restore statuses + computed values    (Manual for resolved)
//!     └── same drive loop, resumption_count + 1
//! ```

pub mod cache;
pub mod cancel;
pub mod retry;
pub mod scheduler;
pub mod signature;
pub mod state;
pub mod transform;

pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use cancel::CancelHandle;
pub use retry::RetryPolicy;
pub use scheduler::{DriveOutcome, ExecutionDriver, Throttle};
pub use signature::{
    BlockedModule, DataSignature, ExecutionMetadata, ExecutionOptions, ProvenanceEntry,
    SignatureStatus,
};
pub use state::{ExecutionState, ModuleStatus, ModuleTiming, ResolutionSource};
pub use transform::TransformError;

use crate::config::Config;
use crate::dag::{CanonicalForm, DagSpec, ModuleCallOptions};
use crate::error::{EngineError, EngineResult};
use crate::registry::{LoadedPipeline, ModuleBody, ModuleDefinition, ModuleRegistry};
use crate::store::PipelineStore;
use crate::suspend::{SuspendedExecution, SuspensionStore};
use crate::value::CValue;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// The engine: registry + store + suspension store + scheduler.
pub struct Engine {
    config: Config,
    registry: ModuleRegistry,
    store: PipelineStore,
    suspensions: SuspensionStore,
    cache: Arc<ResultCache>,
    resumes_in_flight: DashMap<String, ()>,
}

impl Engine {
    pub fn new(config: Config) -> EngineResult<Self> {
        let suspensions = match &config.suspend.data_dir {
            Some(dir) => SuspensionStore::with_data_dir(dir.clone())?,
            None => SuspensionStore::new(),
        };
        let cache = Arc::new(ResultCache::new(config.engine.max_cache_entries));
        Ok(Engine {
            config,
            registry: ModuleRegistry::new(),
            store: PipelineStore::new(),
            suspensions,
            cache,
            resumes_in_flight: DashMap::new(),
        })
    }

    /// Engine with default configuration and in-memory stores.
    pub fn with_defaults() -> Self {
        Engine::new(Config::default()).expect("default config needs no I/O")
    }

    // ----- module management -------------------------------------------

    pub fn register_module(&self, module: ModuleDefinition) {
        self.registry.register(module);
    }

    pub fn remove_module(&self, name: &str) -> bool {
        self.registry.deregister(name)
    }

    pub fn get_modules(&self) -> Vec<Arc<ModuleDefinition>> {
        self.registry.list_modules()
    }

    pub fn published_modules(&self) -> Vec<Arc<ModuleDefinition>> {
        self.registry.published_modules()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn suspensions(&self) -> &SuspensionStore {
        &self.suspensions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ----- pipeline resolution -----------------------------------------

    /// Resolve a pipeline reference: an alias name or `sha256:<hash>`.
    pub fn load_ref(&self, pipeline_ref: &str) -> EngineResult<LoadedPipeline> {
        let image = if let Some(hash) = pipeline_ref.strip_prefix("sha256:") {
            self.store.get(hash)
        } else {
            self.store.get_by_name(pipeline_ref)
        }
        .ok_or_else(|| {
            EngineError::Store(crate::store::StoreError::PipelineNotFound(
                pipeline_ref.to_string(),
            ))
        })?;
        Ok(self.registry.load(image)?)
    }

    // ----- execution ----------------------------------------------------

    /// Execute a loaded pipeline against user inputs.
    pub async fn run(
        &self,
        loaded: &LoadedPipeline,
        inputs: HashMap<String, CValue>,
        options: ExecutionOptions,
    ) -> EngineResult<DataSignature> {
        self.run_with_cancel(loaded, inputs, options, CancelHandle::new())
            .await
    }

    /// Execute a loaded pipeline with an external cancellation handle; the
    /// caller can cancel the in-flight execution from another task.
    pub async fn run_with_cancel(
        &self,
        loaded: &LoadedPipeline,
        inputs: HashMap<String, CValue>,
        options: ExecutionOptions,
        cancel: CancelHandle,
    ) -> EngineResult<DataSignature> {
        let dag = Arc::new(loaded.image.dag_spec.clone());
        let state = Arc::new(ExecutionState::new(dag.modules.keys().copied()));

        for (name, value) in &inputs {
            let data_id = self.validate_input(&dag, name, value)?;
            state.publish(data_id, value.clone().into_raw(), ResolutionSource::Input);
        }

        self.execute(
            dag,
            Arc::new(loaded.image.module_options.clone()),
            state,
            Uuid::new_v4().to_string(),
            0,
            inputs,
            loaded.image.structural_hash.clone(),
            options,
            cancel,
        )
        .await
    }

    /// Execute a pipeline resolved by alias or `sha256:<hash>`.
    pub async fn run_ref(
        &self,
        pipeline_ref: &str,
        inputs: HashMap<String, CValue>,
        options: ExecutionOptions,
    ) -> EngineResult<DataSignature> {
        let loaded = self.load_ref(pipeline_ref)?;
        self.run(&loaded, inputs, options).await
    }

    /// Resume a suspended execution.
    ///
    /// `additional_inputs` supply user inputs missing at suspension;
    /// `resolved_nodes` supply values for data nodes the engine could not
    /// compute itself (e.g. a human-in-the-loop step), recorded with
    /// `Manual` provenance.
    pub async fn resume(
        &self,
        snapshot: &SuspendedExecution,
        additional_inputs: HashMap<String, CValue>,
        resolved_nodes: HashMap<String, CValue>,
        options: ExecutionOptions,
    ) -> EngineResult<DataSignature> {
        let _guard = ResumeGuard::acquire(&self.resumes_in_flight, &snapshot.execution_id)?;

        let current = crate::dag::structural_hash(&snapshot.dag_spec, &snapshot.module_options);
        if current != snapshot.structural_hash {
            return Err(EngineError::PipelineChanged {
                expected: snapshot.structural_hash.clone(),
                actual: current,
            });
        }
        for name in additional_inputs.keys() {
            if snapshot.provided_inputs.contains_key(name) {
                return Err(EngineError::InputAlreadyProvided { input: name.clone() });
            }
        }

        let dag = Arc::new(snapshot.dag_spec.clone());
        let state = Arc::new(ExecutionState::new(dag.modules.keys().copied()));

        // Restore module statuses; anything non-terminal (and anything
        // cancelled) runs again.
        for (id, tag) in &snapshot.module_statuses {
            let status = ModuleStatus::parse(tag).unwrap_or(ModuleStatus::Pending);
            let restored = match status {
                ModuleStatus::Completed | ModuleStatus::Failed | ModuleStatus::Skipped => status,
                _ => ModuleStatus::Pending,
            };
            state.set_status(*id, restored);
        }

        // Restore resolved data, distinguishing user inputs by name.
        for (id, value) in &snapshot.computed_values {
            let source = dag
                .data
                .get(id)
                .filter(|node| snapshot.provided_inputs.contains_key(&node.name))
                .map_or(ResolutionSource::Computed, |_| ResolutionSource::Input);
            state.publish(*id, value.clone().into_raw(), source);
        }

        for (name, value) in &additional_inputs {
            let data_id = self.validate_input(&dag, name, value)?;
            if state.is_resolved(data_id) {
                return Err(EngineError::InputAlreadyProvided { input: name.clone() });
            }
            state.publish(data_id, value.clone().into_raw(), ResolutionSource::Input);
        }

        for (name, value) in &resolved_nodes {
            let data_id = dag
                .data_by_name(name)
                .ok_or_else(|| EngineError::InputValidation {
                    input: name.clone(),
                    reason: "no data node with this name".to_string(),
                })?;
            let node = &dag.data[&data_id];
            if state.is_resolved(data_id) {
                return Err(EngineError::InputAlreadyProvided { input: name.clone() });
            }
            if value.ctype() != node.ctype {
                return Err(EngineError::InputValidation {
                    input: name.clone(),
                    reason: format!(
                        "expected {}, got {}",
                        node.ctype.signature(),
                        value.ctype().signature()
                    ),
                });
            }
            state.publish(data_id, value.clone().into_raw(), ResolutionSource::Manual);
        }

        let mut provided = snapshot.provided_inputs.clone();
        provided.extend(additional_inputs);

        self.execute(
            dag,
            Arc::new(snapshot.module_options.clone()),
            state,
            snapshot.execution_id.clone(),
            snapshot.resumption_count + 1,
            provided,
            snapshot.structural_hash.clone(),
            options,
            CancelHandle::new(),
        )
        .await
    }

    /// Resume a snapshot persisted in the suspension store.
    pub async fn resume_from_store(
        &self,
        handle: &str,
        additional_inputs: HashMap<String, CValue>,
        resolved_nodes: HashMap<String, CValue>,
        options: ExecutionOptions,
    ) -> EngineResult<DataSignature> {
        let snapshot = self
            .suspensions
            .load(handle)?
            .ok_or_else(|| EngineError::Suspend(crate::suspend::SuspendError::NotFound(
                handle.to_string(),
            )))?;
        self.resume(&snapshot, additional_inputs, resolved_nodes, options)
            .await
    }

    // ----- internals ----------------------------------------------------

    fn validate_input(
        &self,
        dag: &DagSpec,
        name: &str,
        value: &CValue,
    ) -> EngineResult<Uuid> {
        let data_id = dag
            .data_by_name(name)
            .ok_or_else(|| EngineError::InputValidation {
                input: name.to_string(),
                reason: "no input node with this name".to_string(),
            })?;
        let node = &dag.data[&data_id];
        if node.inline_transform.is_some() || dag.producer_of(data_id).is_some() {
            return Err(EngineError::InputValidation {
                input: name.to_string(),
                reason: "node is computed, not a user input".to_string(),
            });
        }
        if value.ctype() != node.ctype {
            return Err(EngineError::InputValidation {
                input: name.to_string(),
                reason: format!(
                    "expected {}, got {}",
                    node.ctype.signature(),
                    value.ctype().signature()
                ),
            });
        }
        Ok(data_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        dag: Arc<DagSpec>,
        module_options: Arc<HashMap<Uuid, ModuleCallOptions>>,
        state: Arc<ExecutionState>,
        execution_id: String,
        resumption_count: u32,
        provided_inputs: HashMap<String, CValue>,
        structural_hash: String,
        options: ExecutionOptions,
        cancel: CancelHandle,
    ) -> EngineResult<DataSignature> {
        // Resolve bodies; modules already terminal (restored from a
        // snapshot) don't need an implementation present.
        let mut bodies: HashMap<Uuid, Arc<dyn ModuleBody>> = HashMap::new();
        for (id, node) in &dag.modules {
            match self.registry.resolve_body(node) {
                Ok(body) => {
                    bodies.insert(*id, body);
                }
                Err(e) => {
                    let terminal = state
                        .status_of(*id)
                        .is_some_and(|status| status.is_terminal());
                    if !terminal {
                        return Err(e.into());
                    }
                }
            }
        }

        let canonical = CanonicalForm::of(&dag, &module_options);
        let mut driver = ExecutionDriver::new(
            Arc::clone(&dag),
            module_options,
            bodies,
            Arc::new(canonical.index_of),
            Arc::clone(&state),
            self.config.engine.clone(),
            Arc::clone(&self.cache),
            cancel,
        );
        tracing::info!(
            execution_id = %execution_id,
            pipeline = %dag.metadata.name,
            resumption_count,
            "execution_started"
        );
        let outcome = driver.drive().await;

        let signature = self.build_signature(
            &dag,
            &driver,
            outcome,
            execution_id,
            resumption_count,
            provided_inputs,
            structural_hash,
            options,
        );
        tracing::info!(
            execution_id = %signature.execution_id,
            status = ?signature.status,
            outputs = signature.outputs.len(),
            "execution_finished"
        );
        Ok(signature)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_signature(
        &self,
        dag: &DagSpec,
        driver: &ExecutionDriver,
        outcome: DriveOutcome,
        execution_id: String,
        resumption_count: u32,
        provided_inputs: HashMap<String, CValue>,
        structural_hash: String,
        options: ExecutionOptions,
    ) -> DataSignature {
        let state = &driver.state;

        let mut computed_nodes: HashMap<String, CValue> = HashMap::new();
        let mut computed_by_id: HashMap<Uuid, CValue> = HashMap::new();
        for (id, raw, _) in state.resolved_nodes() {
            let Some(node) = dag.data.get(&id) else {
                continue;
            };
            match CValue::from_raw(&raw, &node.ctype) {
                Ok(value) => {
                    computed_nodes.insert(node.name.clone(), value.clone());
                    computed_by_id.insert(id, value);
                }
                Err(e) => {
                    tracing::error!(data = %node.name, error = %e, "result_lift_failed");
                }
            }
        }

        let mut outputs = HashMap::new();
        let mut pending_outputs = Vec::new();
        for name in &dag.declared_outputs {
            let resolved = dag
                .output_bindings
                .get(name)
                .and_then(|id| computed_by_id.get(id));
            match resolved {
                Some(value) => {
                    outputs.insert(name.clone(), value.clone());
                }
                None => pending_outputs.push(name.clone()),
            }
        }

        let missing_inputs: Vec<String> = dag
            .input_nodes()
            .into_iter()
            .filter(|id| !state.is_resolved(*id))
            .map(|id| dag.data[&id].name.clone())
            .collect();

        let status = match outcome {
            DriveOutcome::Suspended => SignatureStatus::Suspended,
            DriveOutcome::Cancelled => {
                if outputs.is_empty() {
                    SignatureStatus::Cancelled
                } else {
                    SignatureStatus::PartiallyCompleted
                }
            }
            DriveOutcome::AllTerminal => {
                if pending_outputs.is_empty() {
                    SignatureStatus::Completed
                } else if !outputs.is_empty() {
                    SignatureStatus::PartiallyCompleted
                } else {
                    SignatureStatus::Failed
                }
            }
        };

        let suspended_state = if status == SignatureStatus::Suspended {
            let module_statuses = state
                .statuses()
                .into_iter()
                .map(|(id, s)| (id, s.as_str().to_string()))
                .collect();
            Some(SuspendedExecution {
                execution_id: execution_id.clone(),
                structural_hash: structural_hash.clone(),
                resumption_count,
                dag_spec: dag.clone(),
                module_options: driver.module_options_snapshot(),
                provided_inputs: provided_inputs.clone(),
                computed_values: computed_by_id.clone(),
                module_statuses,
            })
        } else {
            None
        };

        let mut metadata = ExecutionMetadata::default();
        for (id, module_status) in state.statuses() {
            let name = dag
                .modules
                .get(&id)
                .map(|m| m.metadata.name.clone())
                .unwrap_or_else(|| id.to_string());
            if let Some(diagnostic) = state.failure_of(id) {
                metadata.diagnostics.insert(name.clone(), diagnostic);
            }
            metadata.module_statuses.insert(name, module_status);
        }
        if options.include_timings {
            let mut timings = HashMap::new();
            for (id, _) in state.statuses() {
                if let Some(timing) = state.timing_of(id) {
                    let name = dag
                        .modules
                        .get(&id)
                        .map(|m| m.metadata.name.clone())
                        .unwrap_or_else(|| id.to_string());
                    timings.insert(name, timing);
                }
            }
            metadata.timings = Some(timings);
        }
        if options.include_provenance || options.include_resolution_sources {
            let mut provenance = HashMap::new();
            let mut sources = HashMap::new();
            for (id, _, source) in state.resolved_nodes() {
                let Some(node) = dag.data.get(&id) else {
                    continue;
                };
                sources.insert(node.name.clone(), source);
                provenance.insert(
                    node.name.clone(),
                    ProvenanceEntry {
                        source,
                        produced_by: dag
                            .producer_of(id)
                            .and_then(|m| dag.modules.get(&m))
                            .map(|m| m.metadata.name.clone()),
                    },
                );
            }
            if options.include_provenance {
                metadata.provenance = Some(provenance);
            }
            if options.include_resolution_sources {
                metadata.resolution_sources = Some(sources);
            }
        }
        if options.include_blocked_graph {
            let mut blocked = Vec::new();
            for (id, module_status) in state.statuses() {
                if module_status.is_terminal() || module_status == ModuleStatus::Running {
                    continue;
                }
                let missing: Vec<String> = dag
                    .inputs_of(id)
                    .iter()
                    .filter_map(|(_, bound)| *bound)
                    .filter(|d| !state.is_resolved(*d))
                    .map(|d| dag.data[&d].name.clone())
                    .collect();
                blocked.push(BlockedModule {
                    module: dag
                        .modules
                        .get(&id)
                        .map(|m| m.metadata.name.clone())
                        .unwrap_or_else(|| id.to_string()),
                    missing,
                });
            }
            blocked.sort_by(|a, b| a.module.cmp(&b.module));
            metadata.blocked_graph = Some(blocked);
        }

        DataSignature {
            execution_id,
            structural_hash,
            resumption_count,
            status,
            inputs: provided_inputs,
            computed_nodes,
            outputs,
            missing_inputs,
            pending_outputs,
            suspended_state,
            metadata,
        }
    }
}

/// At-most-one resumer per execution id; the slot frees on drop.
struct ResumeGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> ResumeGuard<'a> {
    fn acquire(map: &'a DashMap<String, ()>, execution_id: &str) -> EngineResult<Self> {
        match map.entry(execution_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::ResumeInProgress {
                execution_id: execution_id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Ok(ResumeGuard {
                    map,
                    key: execution_id.to_string(),
                })
            }
        }
    }
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}
