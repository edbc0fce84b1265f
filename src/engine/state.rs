//! Per-Execution Mutable State
//!
//! The data table and module-status map are the only shared mutable
//! structures of a running execution. Both live in concurrent maps with
//! per-key locking and lock-free reads; every write signals the driver's
//! wakeup so scheduling reacts to completions without polling.
//!
//! Ordering guarantee: a data node has exactly one writer, so readers
//! observe either "not yet produced" or the final value, never an
//! intermediate.

use crate::value::RawValue;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Lifecycle of one module node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Suspended,
    Cancelled,
}

impl ModuleStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleStatus::Completed
                | ModuleStatus::Failed
                | ModuleStatus::Skipped
                | ModuleStatus::Cancelled
        )
    }

    /// String tag used in suspension snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Pending => "pending",
            ModuleStatus::Waiting => "waiting",
            ModuleStatus::Running => "running",
            ModuleStatus::Completed => "completed",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Skipped => "skipped",
            ModuleStatus::Suspended => "suspended",
            ModuleStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a snapshot status tag.
    pub fn parse(tag: &str) -> Option<ModuleStatus> {
        Some(match tag {
            "pending" => ModuleStatus::Pending,
            "waiting" => ModuleStatus::Waiting,
            "running" => ModuleStatus::Running,
            "completed" => ModuleStatus::Completed,
            "failed" => ModuleStatus::Failed,
            "skipped" => ModuleStatus::Skipped,
            "suspended" => ModuleStatus::Suspended,
            "cancelled" => ModuleStatus::Cancelled,
            _ => return None,
        })
    }
}

/// How a data node's value came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionSource {
    /// User-supplied at `run`
    Input,
    /// Produced by a module
    Computed,
    /// Supplied on resume
    Manual,
    /// Evaluated from an inline transform
    InlineTransform,
}

/// Wall-clock span of one module's execution, as millisecond offsets from
/// the execution start.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModuleTiming {
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub attempts: u32,
}

/// Mutable state owned by the engine for the duration of one run.
pub struct ExecutionState {
    /// data UUID -> final value; absence means "not yet produced"
    data_table: DashMap<Uuid, RawValue>,
    /// module UUID -> lifecycle status
    statuses: DashMap<Uuid, ModuleStatus>,
    /// data UUID -> provenance of its value
    resolution: DashMap<Uuid, ResolutionSource>,
    /// module UUID -> last failure diagnostic
    failures: DashMap<Uuid, String>,
    /// data UUID -> failure diagnostic for transform evaluation
    data_failures: DashMap<Uuid, String>,
    /// module UUID -> timing span
    timings: DashMap<Uuid, ModuleTiming>,
    /// Wakes the driver loop on any publish or status change
    wakeup: Arc<Notify>,
}

impl ExecutionState {
    pub fn new(module_ids: impl IntoIterator<Item = Uuid>) -> Self {
        let statuses = DashMap::new();
        for id in module_ids {
            statuses.insert(id, ModuleStatus::Pending);
        }
        ExecutionState {
            data_table: DashMap::new(),
            statuses,
            resolution: DashMap::new(),
            failures: DashMap::new(),
            data_failures: DashMap::new(),
            timings: DashMap::new(),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Publish a data node's value. The single-writer invariant makes a
    /// second publish a bug upstream; first write wins and the duplicate
    /// is dropped with a warning.
    pub fn publish(&self, data: Uuid, value: RawValue, source: ResolutionSource) {
        match self.data_table.entry(data) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(value);
                self.resolution.insert(data, source);
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!(data = %data, ?source, "duplicate_publish_dropped");
            }
        }
        self.wakeup.notify_waiters();
    }

    pub fn get(&self, data: Uuid) -> Option<RawValue> {
        self.data_table.get(&data).map(|entry| entry.value().clone())
    }

    pub fn is_resolved(&self, data: Uuid) -> bool {
        self.data_table.contains_key(&data)
    }

    pub fn resolution_of(&self, data: Uuid) -> Option<ResolutionSource> {
        self.resolution.get(&data).map(|entry| *entry.value())
    }

    /// All resolved data nodes with their provenance.
    pub fn resolved_nodes(&self) -> Vec<(Uuid, RawValue, ResolutionSource)> {
        self.data_table
            .iter()
            .map(|entry| {
                let source = self
                    .resolution_of(*entry.key())
                    .unwrap_or(ResolutionSource::Computed);
                (*entry.key(), entry.value().clone(), source)
            })
            .collect()
    }

    pub fn set_status(&self, module: Uuid, status: ModuleStatus) {
        self.statuses.insert(module, status);
        self.wakeup.notify_waiters();
    }

    /// Transition only if the module is currently in `from`; returns
    /// whether the transition happened. Keeps racing writers (driver vs.
    /// module task) from resurrecting a terminal status.
    pub fn transition(&self, module: Uuid, from: ModuleStatus, to: ModuleStatus) -> bool {
        let mut moved = false;
        if let Some(mut entry) = self.statuses.get_mut(&module) {
            if *entry.value() == from {
                *entry.value_mut() = to;
                moved = true;
            }
        }
        if moved {
            self.wakeup.notify_waiters();
        }
        moved
    }

    pub fn status_of(&self, module: Uuid) -> Option<ModuleStatus> {
        self.statuses.get(&module).map(|entry| *entry.value())
    }

    pub fn statuses(&self) -> Vec<(Uuid, ModuleStatus)> {
        self.statuses
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Modules currently in the given status.
    pub fn modules_in(&self, status: ModuleStatus) -> Vec<Uuid> {
        self.statuses
            .iter()
            .filter(|entry| *entry.value() == status)
            .map(|entry| *entry.key())
            .collect()
    }

    /// True once no module can make further progress on its own.
    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(|entry| entry.value().is_terminal())
    }

    pub fn record_failure(&self, module: Uuid, message: impl Into<String>) {
        self.failures.insert(module, message.into());
    }

    pub fn failure_of(&self, module: Uuid) -> Option<String> {
        self.failures.get(&module).map(|entry| entry.value().clone())
    }

    pub fn record_data_failure(&self, data: Uuid, message: impl Into<String>) {
        self.data_failures.insert(data, message.into());
    }

    pub fn data_failure_of(&self, data: Uuid) -> Option<String> {
        self.data_failures
            .get(&data)
            .map(|entry| entry.value().clone())
    }

    pub fn record_timing(&self, module: Uuid, timing: ModuleTiming) {
        self.timings.insert(module, timing);
    }

    pub fn timing_of(&self, module: Uuid) -> Option<ModuleTiming> {
        self.timings.get(&module).map(|entry| *entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_first_write_wins() {
        let state = ExecutionState::new(vec![]);
        let id = Uuid::new_v4();
        state.publish(id, RawValue::Int(1), ResolutionSource::Input);
        state.publish(id, RawValue::Int(2), ResolutionSource::Computed);
        assert_eq!(state.get(id), Some(RawValue::Int(1)));
        assert_eq!(state.resolution_of(id), Some(ResolutionSource::Input));
    }

    #[test]
    fn test_status_transitions() {
        let m = Uuid::new_v4();
        let state = ExecutionState::new(vec![m]);
        assert_eq!(state.status_of(m), Some(ModuleStatus::Pending));
        assert!(state.transition(m, ModuleStatus::Pending, ModuleStatus::Waiting));
        // Stale transition is refused.
        assert!(!state.transition(m, ModuleStatus::Pending, ModuleStatus::Running));
        assert_eq!(state.status_of(m), Some(ModuleStatus::Waiting));
    }

    #[test]
    fn test_all_terminal() {
        let m = Uuid::new_v4();
        let state = ExecutionState::new(vec![m]);
        assert!(!state.all_terminal());
        state.set_status(m, ModuleStatus::Completed);
        assert!(state.all_terminal());
    }

    #[test]
    fn test_status_tags_round_trip() {
        for status in [
            ModuleStatus::Pending,
            ModuleStatus::Waiting,
            ModuleStatus::Running,
            ModuleStatus::Completed,
            ModuleStatus::Failed,
            ModuleStatus::Skipped,
            ModuleStatus::Suspended,
            ModuleStatus::Cancelled,
        ] {
            assert_eq!(ModuleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ModuleStatus::parse("bogus"), None);
    }
}
