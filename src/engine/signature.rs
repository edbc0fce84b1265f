//! Data Signature
//!
//! The record a caller gets back from `run` or `resume`: overall status,
//! resolved values, what is still missing, and optional metadata blocks
//! enabled through [`ExecutionOptions`].

use super::state::{ModuleStatus, ModuleTiming, ResolutionSource};
use crate::suspend::SuspendedExecution;
use crate::value::CValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Overall outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureStatus {
    /// Every declared output resolved
    Completed,
    /// Some declared outputs resolved, the rest unreachable
    PartiallyCompleted,
    /// Halted with a resumable snapshot attached
    Suspended,
    /// No declared output resolved and nothing to resume
    Failed,
    /// Cancelled before any declared output resolved
    Cancelled,
}

/// Metadata toggles recognized by the engine. Defaults are all off; each
/// flag enables the corresponding block in [`ExecutionMetadata`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    pub include_timings: bool,
    pub include_provenance: bool,
    pub include_blocked_graph: bool,
    pub include_resolution_sources: bool,
}

/// Provenance of one resolved data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source: ResolutionSource,
    /// Producing module name, for computed nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
}

/// A module still blocked at the end of a non-completed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedModule {
    pub module: String,
    /// Names of the unresolved data nodes it waits on
    pub missing: Vec<String>,
}

/// Optional metadata blocks of a signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Per-module status at termination (always present)
    pub module_statuses: HashMap<String, ModuleStatus>,
    /// Per-module failure diagnostics (always present, often empty)
    pub diagnostics: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<HashMap<String, ModuleTiming>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<HashMap<String, ProvenanceEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_graph: Option<Vec<BlockedModule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_sources: Option<HashMap<String, ResolutionSource>>,
}

/// Result of one execution, owned by the caller.
#[derive(Debug, Clone)]
pub struct DataSignature {
    pub execution_id: String,
    pub structural_hash: String,
    /// How many times this execution has been resumed
    pub resumption_count: u32,
    pub status: SignatureStatus,
    /// Inputs the caller provided, by data-node name
    pub inputs: HashMap<String, CValue>,
    /// Every resolved data node, by name
    pub computed_nodes: HashMap<String, CValue>,
    /// The subset of `computed_nodes` bound to declared outputs
    pub outputs: HashMap<String, CValue>,
    /// Declared inputs that were never supplied
    pub missing_inputs: Vec<String>,
    /// Declared outputs that did not resolve
    pub pending_outputs: Vec<String>,
    /// Present iff `status == Suspended`
    pub suspended_state: Option<SuspendedExecution>,
    pub metadata: ExecutionMetadata,
}

impl DataSignature {
    /// Convenience accessor for a single output.
    pub fn output(&self, name: &str) -> Option<&CValue> {
        self.outputs.get(name)
    }
}
