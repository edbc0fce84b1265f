//! # Constellation Engine
//!
//! A typed DAG pipeline execution engine: content-addressed pipelines,
//! concurrent dependency-ordered scheduling, and suspend/resume of
//! partial executions.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Compiled DagSpec (external compiler)
//!     ↓
//! [Validation]            → invariants + cycle rejection
//!     ↓
//! [Canonicalization]      → structural hash (UUID-independent)
//!     ↓
//! [Pipeline Store]        → content-addressed images + aliases
//!     ↓
//! [Loading]               → LoadedPipeline (image ready to execute)
//!     ↓
//! [Execution Engine]      → scheduler, retries, timeouts, transforms
//!     ↓
//! DataSignature           → outputs | suspension snapshot | diagnostics
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use constellation::{Engine, ExecutionOptions};
//!
//! let engine = Engine::with_defaults();
//! engine.register_module(upper_module());
//!
//! let hash = engine.store().store(image)?;
//! engine.store().alias("greeting", &hash)?;
//!
//! let signature = engine
//!     .run_ref("greeting", inputs, ExecutionOptions::default())
//!     .await?;
//!
//! // A run missing inputs suspends instead of failing:
//! if let Some(snapshot) = signature.suspended_state {
//!     let handle = engine.suspensions().save(snapshot)?;
//!     // ... later, possibly after a restart ...
//!     engine.resume_from_store(&handle, more_inputs, Default::default(),
//!                              ExecutionOptions::default()).await?;
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Runtime types, typed/raw dual layout, JSON conversion |
//! | `dag` | Pipeline graph spec, validation, canonical hashing |
//! | `store` | Content-addressed image store with aliases |
//! | `registry` | Module implementations, registry hash |
//! | `engine` | Scheduler, state machine, retries, cancellation |
//! | `suspend` | Suspension snapshots, codec, suspension store |
//! | `config` | Hierarchical configuration |

// Core data model
pub mod value;

// Re-export value types for convenience
pub use value::{
    cvalue_to_json, json_to_cvalue, parse_json_str, CType, CValue, ConversionLimits,
    ConversionStrategy, LazyJsonValue, RawValue, ValueError,
};

// Pipeline graph
pub mod dag;

pub use dag::{
    structural_hash, syntactic_hash, validate_dag, ArithOp, BackoffKind, BranchArm,
    CanonicalForm, CmpOp, ComponentMetadata, DagSpec, DagValidationError, DataNodeSpec,
    HttpConfig, InlineTransform, ModuleCallOptions, ModuleConfig, ModuleNodeSpec, OnError,
    PipelineImage, TransformExpr,
};

// Stores
pub mod store;

pub use store::{ImageSummary, PipelineStore, StoreError};

// Module registry
pub mod registry;

pub use registry::{
    module_fn, CallContext, LoadedPipeline, ModuleBody, ModuleDefinition, ModuleFailure,
    ModuleOutcome, ModuleRegistry, ModuleResult, RegistryError,
};

// Execution engine
pub mod engine;

pub use engine::{
    BlockedModule, CancelHandle, DataSignature, Engine, ExecutionMetadata,
    ExecutionOptions, ExecutionState, ModuleStatus, ModuleTiming, ProvenanceEntry,
    ResolutionSource, ResultCache, RetryPolicy, SignatureStatus,
};

// Suspension subsystem
pub mod suspend;

pub use suspend::{
    CodecError, JsonSuspensionCodec, SuspendError, SuspendedExecution, SuspensionCodec,
    SuspensionFilter, SuspensionStore, SuspensionSummary,
};

// Configuration system
pub mod config;

pub use config::{Config, DebugMode};

// Error taxonomy
pub mod error;

pub use error::{EngineError, EngineResult};
