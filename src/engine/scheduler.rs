//! Execution Scheduler
//!
//! The dependency-driven driver loop behind `run` and `resume`.
//!
//! ## Design
//!
//! The driver owns the execution: it evaluates inline transforms the
//! moment their inputs resolve, promotes modules through the status
//! machine, and spawns module bodies onto the tokio runtime under a
//! global worker permit, per-module concurrency permits and a
//! sliding-window throttle. Completed bodies report back over a channel;
//! between events the driver parks on the state's wakeup signal and the
//! execution's cancellation token, so a cancel (or the global deadline
//! expiring, which the driver converts into one) preempts the park.
//!
//! Ready modules are picked by (priority descending, canonical local
//! index ascending); the index comes from the structural-hash pass, which
//! keeps equal-priority scheduling reproducible across runs.

use super::cache::{input_fingerprint, ResultCache};
use super::cancel::CancelHandle;
use super::retry::RetryPolicy;
use super::state::{ExecutionState, ModuleStatus, ModuleTiming, ResolutionSource};
use super::transform::eval_transform;
use crate::config::{DebugMode, EngineConfig};
use crate::dag::{DagSpec, ModuleCallOptions};
use crate::registry::{CallContext, ModuleBody, ModuleFailure, ModuleOutcome};
use crate::value::{CValue, RawValue};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Default priority for modules that set none.
const DEFAULT_PRIORITY: u8 = 50;

/// Driver poll granularity for deadlines and throttles.
const TICK: Duration = Duration::from_millis(10);

/// Sliding-window call throttle for one module.
pub struct Throttle {
    count: u32,
    per: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(count: u32, per: Duration) -> Self {
        Throttle {
            count,
            per,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a slot in the window if one is free.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        while let Some(front) = calls.front() {
            if now.duration_since(*front) > self.per {
                calls.pop_front();
            } else {
                break;
            }
        }
        if (calls.len() as u32) < self.count {
            calls.push_back(now);
            true
        } else {
            false
        }
    }
}

/// How one spawned module invocation ended.
enum TaskResult {
    Body(Result<ModuleOutcome, ModuleFailure>),
    Timeout,
    Cancelled,
}

enum DriverEvent {
    ModuleDone {
        module: Uuid,
        attempt: u32,
        result: TaskResult,
    },
    RetryReady {
        module: Uuid,
    },
}

/// Why the driver loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Every module reached a terminal status
    AllTerminal,
    /// Execution halted with resumable blocked work
    Suspended,
    /// The deadline or a caller cancelled the execution
    Cancelled,
}

/// One execution's scheduling context.
pub struct ExecutionDriver {
    dag: Arc<DagSpec>,
    module_options: Arc<HashMap<Uuid, ModuleCallOptions>>,
    bodies: HashMap<Uuid, Arc<dyn ModuleBody>>,
    canonical_index: Arc<HashMap<Uuid, usize>>,
    pub state: Arc<ExecutionState>,
    cancel: CancelHandle,
    /// Global execution deadline; expiry cancels through the token
    deadline: Option<Instant>,
    config: EngineConfig,
    cache: Arc<ResultCache>,

    global_permits: Arc<Semaphore>,
    module_permits: HashMap<Uuid, Arc<Semaphore>>,
    throttles: HashMap<Uuid, Arc<Throttle>>,

    tx: mpsc::UnboundedSender<DriverEvent>,
    rx: mpsc::UnboundedReceiver<DriverEvent>,

    started: Instant,
    attempts: HashMap<Uuid, u32>,
    start_offsets: HashMap<Uuid, u64>,
    running: HashSet<Uuid>,
    pending_retries: HashSet<Uuid>,
    waiting_since: HashMap<Uuid, Instant>,
    /// Transform data nodes already evaluated or failed
    transforms_done: HashSet<Uuid>,
}

impl ExecutionDriver {
    pub fn new(
        dag: Arc<DagSpec>,
        module_options: Arc<HashMap<Uuid, ModuleCallOptions>>,
        bodies: HashMap<Uuid, Arc<dyn ModuleBody>>,
        canonical_index: Arc<HashMap<Uuid, usize>>,
        state: Arc<ExecutionState>,
        config: EngineConfig,
        cache: Arc<ResultCache>,
        cancel: CancelHandle,
    ) -> Self {
        let workers = config.effective_workers().max(1);
        let global_permits = Arc::new(Semaphore::new(workers));
        let mut module_permits = HashMap::new();
        let mut throttles = HashMap::new();
        for (id, opts) in module_options.iter() {
            if let Some(concurrency) = opts.concurrency {
                module_permits.insert(*id, Arc::new(Semaphore::new(concurrency.max(1) as usize)));
            }
            if let (Some(count), Some(per_ms)) = (opts.throttle_count, opts.throttle_per_ms) {
                throttles.insert(
                    *id,
                    Arc::new(Throttle::new(count.max(1), Duration::from_millis(per_ms))),
                );
            }
        }
        let deadline = config.global_timeout().map(|t| Instant::now() + t);
        let (tx, rx) = mpsc::unbounded_channel();
        ExecutionDriver {
            dag,
            module_options,
            bodies,
            canonical_index,
            state,
            cancel,
            deadline,
            config,
            cache,
            global_permits,
            module_permits,
            throttles,
            tx,
            rx,
            started: Instant::now(),
            attempts: HashMap::new(),
            start_offsets: HashMap::new(),
            running: HashSet::new(),
            pending_retries: HashSet::new(),
            waiting_since: HashMap::new(),
            transforms_done: HashSet::new(),
        }
    }

    fn options_for(&self, module: Uuid) -> ModuleCallOptions {
        self.module_options.get(&module).cloned().unwrap_or_default()
    }

    /// Clone of the option table, for embedding in suspension snapshots.
    pub fn module_options_snapshot(&self) -> HashMap<Uuid, ModuleCallOptions> {
        (*self.module_options).clone()
    }

    fn priority_of(&self, module: Uuid) -> u8 {
        self.options_for(module)
            .priority
            .unwrap_or(DEFAULT_PRIORITY)
            .min(100)
    }

    fn module_name(&self, module: Uuid) -> String {
        self.dag
            .modules
            .get(&module)
            .map(|m| m.metadata.name.clone())
            .unwrap_or_else(|| module.to_string())
    }

    /// Drive the execution until termination, suspension or cancellation.
    pub async fn drive(&mut self) -> DriveOutcome {
        loop {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline && !self.cancel.is_cancelled() {
                    tracing::warn!(
                        elapsed_ms = self.started.elapsed().as_millis() as u64,
                        "execution_deadline_elapsed"
                    );
                    self.cancel.cancel();
                }
            }
            let cancelled = self.cancel.is_cancelled();
            if cancelled {
                self.finish_cancellation();
                if self.running.is_empty() {
                    return DriveOutcome::Cancelled;
                }
            } else {
                let progressed = self.eval_ready_transforms();
                self.promote_waiting();
                self.expire_input_waits();
                let scheduled = self.schedule_ready();

                if self.state.all_terminal() && self.running.is_empty() {
                    return DriveOutcome::AllTerminal;
                }
                if self.outputs_all_resolved() && self.quiet() {
                    self.finalize_leftovers();
                    return DriveOutcome::AllTerminal;
                }
                if !progressed && !scheduled && self.quiet() {
                    match self.analyze_blocked() {
                        BlockedAnalysis::Suspendable => return DriveOutcome::Suspended,
                        BlockedAnalysis::Progressed => continue,
                        BlockedAnalysis::NothingBlocked => {
                            if self.state.all_terminal() {
                                return DriveOutcome::AllTerminal;
                            }
                        }
                    }
                }
            }

            let wakeup = self.state.wakeup();
            let cancel = self.cancel.clone();
            let event = tokio::select! {
                event = self.rx.recv() => event,
                () = wakeup.notified() => None,
                () = cancel.cancelled() => None,
                () = tokio::time::sleep(TICK) => None,
            };
            if let Some(event) = event {
                self.handle_event(event);
                // Drain whatever else arrived while we were parked.
                while let Ok(event) = self.rx.try_recv() {
                    self.handle_event(event);
                }
            }
        }
    }

    fn quiet(&self) -> bool {
        self.running.is_empty() && self.pending_retries.is_empty()
    }

    fn outputs_all_resolved(&self) -> bool {
        self.dag.declared_outputs.iter().all(|name| {
            self.dag
                .output_bindings
                .get(name)
                .is_some_and(|id| self.state.is_resolved(*id))
        })
    }

    /// Evaluate every inline transform whose inputs are all resolved.
    /// Cascades until a fixpoint; returns whether anything was produced.
    fn eval_ready_transforms(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut round = false;
            for (id, node) in &self.dag.data {
                if self.transforms_done.contains(id) || self.state.is_resolved(*id) {
                    continue;
                }
                let Some(transform) = &node.inline_transform else {
                    continue;
                };
                if !node
                    .transform_inputs
                    .values()
                    .all(|input| self.state.is_resolved(*input))
                {
                    continue;
                }
                let mut inputs: HashMap<String, CValue> = HashMap::new();
                let mut lift_failed = None;
                for (name, input_id) in &node.transform_inputs {
                    let raw = self.state.get(*input_id).expect("checked resolved above");
                    let input_node = &self.dag.data[input_id];
                    match CValue::from_raw(&raw, &input_node.ctype) {
                        Ok(v) => {
                            inputs.insert(name.clone(), v);
                        }
                        Err(e) => {
                            lift_failed = Some(e.to_string());
                            break;
                        }
                    }
                }
                self.transforms_done.insert(*id);
                round = true;
                if let Some(reason) = lift_failed {
                    tracing::error!(data = %node.name, error = %reason, "transform_input_lift_failed");
                    self.state.record_data_failure(*id, reason);
                    continue;
                }
                match eval_transform(transform, &inputs, &node.ctype) {
                    Ok(value) => {
                        tracing::debug!(data = %node.name, transform = transform.kind_tag(), "transform_evaluated");
                        self.state
                            .publish(*id, value, ResolutionSource::InlineTransform);
                        progressed = true;
                    }
                    Err(e) => {
                        tracing::error!(data = %node.name, transform = transform.kind_tag(), error = %e, "transform_failed");
                        self.state.record_data_failure(*id, e.to_string());
                    }
                }
            }
            if !round {
                break;
            }
        }
        progressed
    }

    /// Pending -> Waiting once a module has any resolved input (or none to
    /// wait for at all).
    fn promote_waiting(&mut self) {
        for module in self.state.modules_in(ModuleStatus::Pending) {
            let inputs = self.dag.inputs_of(module);
            let any_ready = inputs.is_empty()
                || inputs
                    .iter()
                    .any(|(_, bound)| bound.is_some_and(|d| self.state.is_resolved(d)));
            if any_ready && self.state.transition(module, ModuleStatus::Pending, ModuleStatus::Waiting)
            {
                self.waiting_since.insert(module, Instant::now());
            }
        }
    }

    /// Waiting modules whose inputs never completed within their inputs
    /// timeout either suspend (missing input can still be supplied) or
    /// fail.
    fn expire_input_waits(&mut self) {
        for module in self.state.modules_in(ModuleStatus::Waiting) {
            if self.pending_retries.contains(&module) {
                continue;
            }
            let missing = self.missing_inputs_of(module);
            if missing.is_empty() {
                continue;
            }
            let timeout = self.inputs_timeout_of(module);
            let since = self
                .waiting_since
                .get(&module)
                .copied()
                .unwrap_or(self.started);
            if since.elapsed() <= timeout {
                continue;
            }
            let suppliable = missing.iter().any(|d| self.classify_missing(*d) != MissingClass::Unresolvable);
            if suppliable {
                tracing::warn!(module = %self.module_name(module), "inputs_timeout_suspended");
                self.state.transition(module, ModuleStatus::Waiting, ModuleStatus::Suspended);
            } else {
                tracing::warn!(module = %self.module_name(module), "inputs_timeout_failed");
                self.state.record_failure(module, "inputs timeout elapsed");
                if self.state.transition(module, ModuleStatus::Waiting, ModuleStatus::Failed) {
                    self.cascade_skip(module);
                }
            }
        }
    }

    fn inputs_timeout_of(&self, module: Uuid) -> Duration {
        self.dag
            .modules
            .get(&module)
            .map(|m| Duration::from_millis(m.config.inputs_timeout_ms))
            .unwrap_or_else(|| self.config.default_inputs_timeout())
    }

    fn module_timeout_of(&self, module: Uuid) -> Duration {
        if let Some(ms) = self.options_for(module).timeout_ms {
            return Duration::from_millis(ms);
        }
        self.dag
            .modules
            .get(&module)
            .map(|m| Duration::from_millis(m.config.module_timeout_ms))
            .unwrap_or_else(|| self.config.default_module_timeout())
    }

    fn missing_inputs_of(&self, module: Uuid) -> Vec<Uuid> {
        self.dag
            .inputs_of(module)
            .iter()
            .filter_map(|(_, bound)| match bound {
                Some(d) if !self.state.is_resolved(*d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    /// Modules needed (transitively) by a still-unresolved declared
    /// output; lazily-evaluated modules outside this set are not
    /// scheduled.
    fn needed_modules(&self) -> HashSet<Uuid> {
        let mut needed = HashSet::new();
        let mut stack: Vec<Uuid> = self
            .dag
            .declared_outputs
            .iter()
            .filter_map(|name| self.dag.output_bindings.get(name).copied())
            .filter(|id| !self.state.is_resolved(*id))
            .collect();
        let mut seen_data: HashSet<Uuid> = HashSet::new();
        while let Some(data) = stack.pop() {
            if !seen_data.insert(data) {
                continue;
            }
            if self.state.is_resolved(data) {
                continue;
            }
            if let Some(node) = self.dag.data.get(&data) {
                for input in node.transform_inputs.values() {
                    stack.push(*input);
                }
            }
            if let Some(module) = self.dag.producer_of(data) {
                if needed.insert(module) {
                    for (_, bound) in self.dag.inputs_of(module) {
                        if let Some(d) = bound {
                            stack.push(d);
                        }
                    }
                }
            }
        }
        needed
    }

    /// Pop ready modules in priority order and spawn what the permits
    /// allow. Returns whether anything was spawned or served from cache.
    fn schedule_ready(&mut self) -> bool {
        let needed = self.needed_modules();
        let mut ready: Vec<Uuid> = self
            .state
            .modules_in(ModuleStatus::Waiting)
            .into_iter()
            .filter(|m| !self.pending_retries.contains(m))
            .filter(|m| self.missing_inputs_of(*m).is_empty())
            .filter(|m| {
                let lazy = self.options_for(*m).lazy_eval.unwrap_or(false);
                !lazy || needed.contains(m)
            })
            .collect();
        ready.sort_by_key(|m| {
            (
                std::cmp::Reverse(self.priority_of(*m)),
                self.canonical_index.get(m).copied().unwrap_or(usize::MAX),
            )
        });

        let mut scheduled = false;
        for module in ready {
            let Ok(global) = Arc::clone(&self.global_permits).try_acquire_owned() else {
                break; // worker pool saturated; park until a slot frees
            };
            let module_permit = match self.module_permits.get(&module) {
                Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => continue, // this module is at its concurrency cap
                },
                None => None,
            };
            if let Some(throttle) = self.throttles.get(&module) {
                if !throttle.try_acquire() {
                    continue; // window full; retry on a later tick
                }
            }
            if self.launch(module, global, module_permit) {
                scheduled = true;
            }
        }
        scheduled
    }

    /// Transition one ready module to Running and spawn its body (or serve
    /// it from the result cache).
    fn launch(
        &mut self,
        module: Uuid,
        global: tokio::sync::OwnedSemaphorePermit,
        module_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> bool {
        let Some(inputs) = self.gather_inputs(module) else {
            return false;
        };
        let options = self.options_for(module);
        let attempt = self.attempts.get(&module).copied().unwrap_or(0) + 1;

        // Result cache short-circuit.
        if let Some(cache_ms) = options.cache_ms {
            let fp = input_fingerprint(&inputs);
            if let Some(outputs) = self.cache.get(module, &fp, Duration::from_millis(cache_ms)) {
                if self.state.transition(module, ModuleStatus::Waiting, ModuleStatus::Completed) {
                    tracing::debug!(module = %self.module_name(module), "module_served_from_cache");
                    self.publish_outputs(module, &outputs);
                    let at = self.started.elapsed().as_millis() as u64;
                    self.state.record_timing(
                        module,
                        ModuleTiming {
                            started_at_ms: at,
                            ended_at_ms: at,
                            attempts: 0,
                        },
                    );
                }
                return true;
            }
        }

        if self.config.debug_mode != DebugMode::Off {
            if let Some(violation) = self.check_input_types(module, &inputs) {
                if self.config.debug_mode == DebugMode::Full {
                    self.state.record_failure(module, violation.clone());
                    if self.state.transition(module, ModuleStatus::Waiting, ModuleStatus::Failed) {
                        self.cascade_skip(module);
                    }
                    return false;
                }
                tracing::error!(module = %self.module_name(module), %violation, "input_type_violation");
            }
        }

        if !self.state.transition(module, ModuleStatus::Waiting, ModuleStatus::Running) {
            return false;
        }
        self.attempts.insert(module, attempt);
        self.running.insert(module);
        self.start_offsets
            .entry(module)
            .or_insert(self.started.elapsed().as_millis() as u64);

        let body = match self.bodies.get(&module) {
            Some(b) => Arc::clone(b),
            None => {
                // Resolution happens before drive(); a miss here is a bug
                // upstream, surfaced as a fatal module failure.
                self.running.remove(&module);
                self.state
                    .record_failure(module, "no implementation resolved");
                self.state.set_status(module, ModuleStatus::Failed);
                self.cascade_skip(module);
                return false;
            }
        };
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let timeout = self.module_timeout_of(module);
        let name = self.module_name(module);
        tracing::debug!(module = %name, attempt, "module_started");

        tokio::spawn(async move {
            let _global = global;
            let _module_permit = module_permit;
            let ctx = CallContext {
                cancel: cancel.clone(),
                attempt,
            };
            let body_future = body.call(inputs, ctx);
            let result = tokio::select! {
                outcome = tokio::time::timeout(timeout, body_future) => match outcome {
                    Ok(r) => TaskResult::Body(r),
                    Err(_) => TaskResult::Timeout,
                },
                () = cancel.cancelled() => TaskResult::Cancelled,
            };
            let _ = tx.send(DriverEvent::ModuleDone {
                module,
                attempt,
                result,
            });
        });
        true
    }

    fn gather_inputs(&self, module: Uuid) -> Option<HashMap<String, RawValue>> {
        let mut inputs = HashMap::new();
        for (param, bound) in self.dag.inputs_of(module) {
            let data = bound?;
            let value = self.state.get(data)?;
            inputs.insert(param, value);
        }
        Some(inputs)
    }

    /// Shallow debug-mode check of an input record against `consumes`.
    fn check_input_types(&self, module: Uuid, inputs: &HashMap<String, RawValue>) -> Option<String> {
        let spec = self.dag.modules.get(&module)?;
        for (param, declared) in &spec.consumes {
            let Some(value) = inputs.get(param) else {
                return Some(format!("input '{param}' missing"));
            };
            if !value.conforms_shallow(declared) {
                return Some(format!(
                    "input '{}' expected {}, got {}",
                    param,
                    declared.signature(),
                    value.kind_name()
                ));
            }
        }
        None
    }

    fn check_output_types(
        &self,
        module: Uuid,
        outputs: &HashMap<String, RawValue>,
    ) -> Option<String> {
        let spec = self.dag.modules.get(&module)?;
        for (field, declared) in &spec.produces {
            let Some(value) = outputs.get(field) else {
                return Some(format!("output '{field}' missing"));
            };
            if !value.conforms_shallow(declared) {
                return Some(format!(
                    "output '{}' expected {}, got {}",
                    field,
                    declared.signature(),
                    value.kind_name()
                ));
            }
        }
        None
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::RetryReady { module } => {
                self.pending_retries.remove(&module);
            }
            DriverEvent::ModuleDone {
                module,
                attempt,
                result,
            } => {
                self.running.remove(&module);
                let ended = self.started.elapsed().as_millis() as u64;
                self.state.record_timing(
                    module,
                    ModuleTiming {
                        started_at_ms: self.start_offsets.get(&module).copied().unwrap_or(0),
                        ended_at_ms: ended,
                        attempts: attempt,
                    },
                );
                match result {
                    TaskResult::Body(Ok(ModuleOutcome::Completed(outputs))) => {
                        self.complete_module(module, outputs);
                    }
                    TaskResult::Body(Ok(ModuleOutcome::Pending)) => {
                        tracing::debug!(module = %self.module_name(module), "module_reported_pending");
                        self.state
                            .transition(module, ModuleStatus::Running, ModuleStatus::Suspended);
                    }
                    TaskResult::Body(Err(failure)) => {
                        self.fail_or_retry(module, attempt, failure);
                    }
                    TaskResult::Timeout => {
                        tracing::warn!(module = %self.module_name(module), attempt, "module_timed_out");
                        self.state.record_failure(module, "module timeout elapsed");
                        if self
                            .state
                            .transition(module, ModuleStatus::Running, ModuleStatus::Failed)
                        {
                            self.apply_on_error(module);
                        }
                    }
                    TaskResult::Cancelled => {
                        self.state
                            .transition(module, ModuleStatus::Running, ModuleStatus::Cancelled);
                    }
                }
            }
        }
    }

    fn complete_module(&mut self, module: Uuid, outputs: HashMap<String, RawValue>) {
        if self.config.debug_mode != DebugMode::Off {
            if let Some(violation) = self.check_output_types(module, &outputs) {
                if self.config.debug_mode == DebugMode::Full {
                    self.state.record_failure(module, violation);
                    if self
                        .state
                        .transition(module, ModuleStatus::Running, ModuleStatus::Failed)
                    {
                        self.apply_on_error(module);
                    }
                    return;
                }
                tracing::error!(module = %self.module_name(module), %violation, "output_type_violation");
            }
        }
        if self
            .state
            .transition(module, ModuleStatus::Running, ModuleStatus::Completed)
        {
            tracing::debug!(module = %self.module_name(module), "module_completed");
            if self.options_for(module).cache_ms.is_some() {
                if let Some(inputs) = self.gather_inputs(module) {
                    let fp = input_fingerprint(&inputs);
                    self.cache.put(module, &fp, outputs.clone());
                }
            }
            self.publish_outputs(module, &outputs);
        }
    }

    fn publish_outputs(&self, module: Uuid, outputs: &HashMap<String, RawValue>) {
        for (field, bound) in self.dag.outputs_of(module) {
            let Some(data) = bound else {
                continue; // unconsumed output field
            };
            match outputs.get(&field) {
                Some(value) => {
                    self.state
                        .publish(data, value.clone(), ResolutionSource::Computed);
                }
                None => {
                    tracing::warn!(
                        module = %self.module_name(module),
                        field = %field,
                        "declared_output_not_produced"
                    );
                    self.state
                        .record_data_failure(data, format!("output field '{field}' not produced"));
                }
            }
        }
    }

    fn fail_or_retry(&mut self, module: Uuid, attempt: u32, failure: ModuleFailure) {
        let policy = RetryPolicy::from_options(&self.options_for(module));
        if failure.retriable && policy.allows_retry(attempt) {
            let delay = policy.backoff_delay(attempt);
            tracing::warn!(
                module = %self.module_name(module),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "module_retry_scheduled"
            );
            if self
                .state
                .transition(module, ModuleStatus::Running, ModuleStatus::Waiting)
            {
                self.pending_retries.insert(module);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(DriverEvent::RetryReady { module });
                });
                return;
            }
        }
        tracing::error!(
            module = %self.module_name(module),
            attempt,
            error = %failure,
            "module_failed"
        );
        self.state.record_failure(module, failure.message);
        if self
            .state
            .transition(module, ModuleStatus::Running, ModuleStatus::Failed)
        {
            self.apply_on_error(module);
        }
    }

    /// Post-failure policy: `fail` cascades a skip through dependents,
    /// `skip` rewrites the failure into a skip and lets siblings continue.
    fn apply_on_error(&mut self, module: Uuid) {
        match self.options_for(module).on_error.unwrap_or(crate::dag::OnError::Fail) {
            crate::dag::OnError::Fail => self.cascade_skip(module),
            crate::dag::OnError::Skip => {
                self.state.set_status(module, ModuleStatus::Skipped);
                self.cascade_skip(module);
            }
        }
    }

    /// Mark every not-yet-started module that transitively depends on a
    /// terminal failure as Skipped, and its output data as unresolvable.
    fn cascade_skip(&mut self, failed: Uuid) {
        let mut dead_data: Vec<Uuid> = self
            .dag
            .outputs_of(failed)
            .iter()
            .filter_map(|(_, bound)| *bound)
            .collect();
        let mut seen: HashSet<Uuid> = HashSet::new();
        while let Some(data) = dead_data.pop() {
            if !seen.insert(data) || self.state.is_resolved(data) {
                continue;
            }
            if self.state.data_failure_of(data).is_none() {
                self.state
                    .record_data_failure(data, "upstream producer failed or was skipped");
            }
            // Transform nodes reading this data can never fire.
            for (id, node) in &self.dag.data {
                if node.transform_inputs.values().any(|d| *d == data) && !seen.contains(id) {
                    dead_data.push(*id);
                }
            }
            // Consuming modules skip, and their outputs die in turn.
            for (d, module) in self.dag.in_edges.iter() {
                if *d != data {
                    continue;
                }
                let status = self.state.status_of(*module);
                let skippable = matches!(
                    status,
                    Some(ModuleStatus::Pending) | Some(ModuleStatus::Waiting)
                );
                if skippable {
                    tracing::debug!(module = %self.module_name(*module), "module_cascade_skipped");
                    self.state.set_status(*module, ModuleStatus::Skipped);
                    self.state
                        .record_failure(*module, "skipped: upstream failure");
                    for (_, bound) in self.dag.outputs_of(*module) {
                        if let Some(out) = bound {
                            dead_data.push(out);
                        }
                    }
                }
            }
        }
    }

    /// Classify an unresolved data node for the suspension decision.
    fn classify_missing(&self, data: Uuid) -> MissingClass {
        let mut visited = HashSet::new();
        self.classify_missing_inner(data, &mut visited)
    }

    fn classify_missing_inner(&self, data: Uuid, visited: &mut HashSet<Uuid>) -> MissingClass {
        if !visited.insert(data) {
            // The graph is acyclic, so a revisit is a diamond whose
            // contribution the first visit already accounted for.
            return MissingClass::Producible;
        }
        if self.state.is_resolved(data) {
            return MissingClass::Producible;
        }
        if self.state.data_failure_of(data).is_some() {
            return MissingClass::Unresolvable;
        }
        let node = match self.dag.data.get(&data) {
            Some(n) => n,
            None => return MissingClass::Unresolvable,
        };
        if node.inline_transform.is_some() {
            // The transform fires iff all its inputs can exist.
            let mut class = MissingClass::Producible;
            for input in node.transform_inputs.values() {
                match self.classify_missing_inner(*input, visited) {
                    MissingClass::Unresolvable => return MissingClass::Unresolvable,
                    MissingClass::Suppliable => class = MissingClass::Suppliable,
                    MissingClass::Producible => {}
                }
            }
            return class;
        }
        match self.dag.producer_of(data) {
            None => MissingClass::Suppliable, // user input never provided
            Some(module) => match self.state.status_of(module) {
                Some(ModuleStatus::Failed)
                | Some(ModuleStatus::Skipped)
                | Some(ModuleStatus::Cancelled) => MissingClass::Unresolvable,
                Some(ModuleStatus::Suspended) => MissingClass::Suppliable,
                Some(ModuleStatus::Completed) => {
                    // Completed but this output never materialized.
                    MissingClass::Unresolvable
                }
                _ => {
                    // The producer itself waits on something upstream.
                    let mut class = MissingClass::Producible;
                    for (_, bound) in self.dag.inputs_of(module) {
                        let Some(input) = bound else {
                            return MissingClass::Unresolvable;
                        };
                        match self.classify_missing_inner(input, visited) {
                            MissingClass::Unresolvable => return MissingClass::Unresolvable,
                            MissingClass::Suppliable => class = MissingClass::Suppliable,
                            MissingClass::Producible => {}
                        }
                    }
                    class
                }
            },
        }
    }

    /// Quiesced with non-terminal modules: decide between suspension,
    /// cascading unresolvable work away, or nothing left to do.
    fn analyze_blocked(&mut self) -> BlockedAnalysis {
        let blocked: Vec<Uuid> = self
            .state
            .statuses()
            .into_iter()
            .filter(|(_, status)| {
                matches!(
                    status,
                    ModuleStatus::Pending | ModuleStatus::Waiting | ModuleStatus::Suspended
                )
            })
            .map(|(id, _)| id)
            .collect();
        if blocked.is_empty() {
            return BlockedAnalysis::NothingBlocked;
        }

        let mut any_suspendable = false;
        let mut unresolvable: Vec<Uuid> = Vec::new();
        for module in &blocked {
            if self.state.status_of(*module) == Some(ModuleStatus::Suspended) {
                any_suspendable = true;
                continue;
            }
            let missing = self.missing_inputs_of(*module);
            let classes: Vec<MissingClass> =
                missing.iter().map(|d| self.classify_missing(*d)).collect();
            if classes.iter().any(|c| *c == MissingClass::Unresolvable) {
                unresolvable.push(*module);
            } else if classes.iter().any(|c| *c == MissingClass::Suppliable) {
                any_suspendable = true;
            }
        }

        if !unresolvable.is_empty() && !any_suspendable {
            // Nothing to wait for; fold the unreachable work into skips
            // and let the loop re-evaluate.
            for module in unresolvable {
                self.state.set_status(module, ModuleStatus::Skipped);
                self.state
                    .record_failure(module, "skipped: upstream failure");
            }
            return BlockedAnalysis::Progressed;
        }

        if any_suspendable {
            // Halt scheduling; blocked modules record as Suspended.
            for module in blocked {
                let status = self.state.status_of(module);
                if matches!(
                    status,
                    Some(ModuleStatus::Pending) | Some(ModuleStatus::Waiting)
                ) {
                    let missing = self.missing_inputs_of(module);
                    let suspendable = missing
                        .iter()
                        .any(|d| self.classify_missing(*d) == MissingClass::Suppliable);
                    if suspendable {
                        self.state.set_status(module, ModuleStatus::Suspended);
                    }
                }
            }
            tracing::warn!("execution_suspended");
            return BlockedAnalysis::Suspendable;
        }
        BlockedAnalysis::NothingBlocked
    }

    /// All declared outputs are in; whatever never ran is skipped.
    fn finalize_leftovers(&mut self) {
        for (module, status) in self.state.statuses() {
            if !status.is_terminal() {
                self.state.set_status(module, ModuleStatus::Skipped);
            }
        }
    }

    /// Deadline expired or caller cancelled: running modules keep their
    /// tasks (they observe the token), everything not yet started skips.
    fn finish_cancellation(&mut self) {
        for (module, status) in self.state.statuses() {
            match status {
                ModuleStatus::Pending | ModuleStatus::Waiting | ModuleStatus::Suspended => {
                    self.state.set_status(module, ModuleStatus::Skipped);
                }
                _ => {}
            }
        }
        self.pending_retries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingClass {
    /// A user input that can still be supplied (or a pending module)
    Suppliable,
    /// Upstream failure makes it impossible
    Unresolvable,
    /// Still producible by scheduled work
    Producible,
}

enum BlockedAnalysis {
    Suspendable,
    Progressed,
    NothingBlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_window() {
        let throttle = Throttle::new(2, Duration::from_millis(200));
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
        std::thread::sleep(Duration::from_millis(250));
        assert!(throttle.try_acquire());
    }
}
