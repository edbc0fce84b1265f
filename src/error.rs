//! Engine Error Types
//!
//! The error taxonomy of the public API. Errors are values the engine
//! composes explicitly; module timeouts and cancellations are modeled as
//! statuses, not errors, so a failing execution still returns a
//! `DataSignature` rather than an `Err`.

use thiserror::Error;

/// Engine-wide errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Value conversion or typing failure
    #[error(transparent)]
    Value(#[from] crate::value::ValueError),

    /// DAG rejected at load
    #[error(transparent)]
    Validation(#[from] crate::dag::DagValidationError),

    /// Pipeline store failure
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Module registry failure
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    /// Suspension store failure
    #[error(transparent)]
    Suspend(#[from] crate::suspend::SuspendError),

    /// Snapshot codec failure
    #[error(transparent)]
    Codec(#[from] crate::suspend::CodecError),

    /// A user input failed validation before execution began
    #[error("Invalid input '{input}': {reason}")]
    InputValidation { input: String, reason: String },

    /// A resume supplied an input the snapshot already holds
    #[error("Input '{input}' was already provided before suspension")]
    InputAlreadyProvided { input: String },

    /// Snapshot does not match the pipeline it claims to resume
    #[error("Pipeline changed: snapshot was taken against {expected}, current is {actual}")]
    PipelineChanged { expected: String, actual: String },

    /// Another resume is in flight for the same execution
    #[error("A resume is already in progress for execution {execution_id}")]
    ResumeInProgress { execution_id: String },

    /// A dependent read a data node that was never produced
    #[error("Data node '{node}' was not produced")]
    DataNotFound { node: String },

    /// A module body failed fatally
    #[error("Module '{module}' failed: {message}")]
    ModuleExecution { module: String, message: String },

    /// Configuration loading failure
    #[error("Config error: {0}")]
    Config(#[from] figment::Error),

    /// Ambient I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
