//! Concurrency & Cancellation Tests
//!
//! - Per-module concurrency caps are never exceeded
//! - Independent modules run in parallel
//! - Priority and canonical-index tiebreaks order the ready queue
//! - External cancellation yields Cancelled/PartiallyCompleted
//! - Concurrent resumes of the same execution are refused

mod common;

use common::*;
use constellation::{
    module_fn, CType, CValue, CancelHandle, ComponentMetadata, Engine, ExecutionOptions,
    ModuleCallOptions, ModuleDefinition, ModuleOutcome, RawValue, SignatureStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn inputs(pairs: Vec<(&str, CValue)>) -> HashMap<String, CValue> {
    pairs.into_iter().map(|(n, v)| (n.to_string(), v)).collect()
}

/// A module that tracks its own concurrent invocation count.
fn tracking_module(
    name: &str,
    live: Arc<AtomicU32>,
    max_seen: Arc<AtomicU32>,
    hold_ms: u64,
) -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new(name, 1, 0),
        consumes: vec![("text".to_string(), CType::String)],
        produces: vec![("result".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(move |inputs, _ctx| {
            let live = Arc::clone(&live);
            let max_seen = Arc::clone(&max_seen);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(hold_ms)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                let text = match inputs.get("text") {
                    Some(RawValue::String(s)) => s.clone(),
                    _ => String::new(),
                };
                Ok(ModuleOutcome::Completed(
                    [("result".to_string(), RawValue::String(text))]
                        .into_iter()
                        .collect(),
                ))
            }
        }),
    }
}

/// Fan a single input into `n` independent modules, each with its own
/// output.
fn fan_out_image(n: usize, options: Option<ModuleCallOptions>) -> constellation::PipelineImage {
    let mut b = DagBuilder::new("fanout");
    let input = b.data("in", CType::String);
    for i in 0..n {
        let out = b.data(&format!("out{i}"), CType::String);
        let module = b.module(
            module_spec(
                "Track",
                &[("text", CType::String)],
                &[("result", CType::String)],
            ),
            &[("text", input)],
            &[("result", out)],
        );
        if let Some(opts) = &options {
            b.with_options(module, opts.clone());
        }
        b.output(&format!("out{i}"), out);
    }
    b.image(None)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_cap_respected() {
    let engine = Engine::with_defaults();
    let live = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));
    engine.register_module(tracking_module(
        "Track",
        Arc::clone(&live),
        Arc::clone(&max_seen),
        20,
    ));

    let image = fan_out_image(
        6,
        Some(ModuleCallOptions {
            concurrency: Some(2),
            ..ModuleCallOptions::default()
        }),
    );
    let hash = engine.store().store(image).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let sig = engine
        .run(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(sig.status, SignatureStatus::Completed);
    assert_eq!(sig.outputs.len(), 6);
    assert!(
        max_seen.load(Ordering::SeqCst) <= 2,
        "cap of 2 exceeded: saw {}",
        max_seen.load(Ordering::SeqCst)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_modules_run_in_parallel() {
    let engine = Engine::with_defaults();
    let live = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));
    engine.register_module(tracking_module(
        "Track",
        Arc::clone(&live),
        Arc::clone(&max_seen),
        50,
    ));

    let image = fan_out_image(4, None);
    let hash = engine.store().store(image).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let started = std::time::Instant::now();
    let sig = engine
        .run(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(sig.status, SignatureStatus::Completed);
    assert!(max_seen.load(Ordering::SeqCst) >= 2, "never overlapped");
    // Serial execution would take >= 200ms.
    assert!(started.elapsed().as_millis() < 200);
}

#[tokio::test]
async fn test_throttle_limits_call_rate() {
    // The throttle is a per-module sliding window, so retries of one
    // module are what it actually paces.
    let engine = Engine::with_defaults();
    let calls = Arc::new(AtomicU32::new(0));
    engine.register_module(common::flaky_module(3, Arc::clone(&calls)));

    let mut b = DagBuilder::new("throttled");
    let input = b.data("in", CType::String);
    let out = b.data("out", CType::String);
    let module = b.module(
        module_spec(
            "Flaky",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", out)],
    );
    b.with_options(
        module,
        ModuleCallOptions {
            retry: Some(2),
            delay_ms: Some(1),
            throttle_count: Some(1),
            throttle_per_ms: Some(100),
            ..ModuleCallOptions::default()
        },
    );
    b.output("out", out);
    let hash = engine.store().store(b.image(None)).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let started = std::time::Instant::now();
    let sig = engine
        .run(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(sig.status, SignatureStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Attempts 2 and 3 each waited out the 100ms window.
    assert!(started.elapsed().as_millis() >= 190);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_cancellation() {
    let engine = Arc::new(Engine::with_defaults());
    engine.register_module(sleeper_module("Sleeper", 10_000));

    let mut b = DagBuilder::new("sleepy");
    let input = b.data("in", CType::String);
    let out = b.data("out", CType::String);
    b.module(
        module_spec(
            "Sleeper",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", out)],
    );
    b.output("out", out);
    let hash = engine.store().store(b.image(None)).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let cancel = CancelHandle::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let sig = engine
        .run_with_cancel(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
            cancel,
        )
        .await
        .unwrap();

    assert!(matches!(
        sig.status,
        SignatureStatus::Cancelled | SignatureStatus::PartiallyCompleted
    ));
    // Far sooner than the module's 10s sleep.
    assert!(started.elapsed().as_secs() < 5);
}

#[tokio::test]
async fn test_global_timeout_cancels_execution() {
    let mut config = constellation::Config::default();
    config.engine.global_timeout_ms = 50;
    let engine = Engine::new(config).unwrap();
    engine.register_module(sleeper_module("Sleeper", 10_000));

    let mut b = DagBuilder::new("sleepy");
    let input = b.data("in", CType::String);
    let out = b.data("out", CType::String);
    b.module(
        module_spec(
            "Sleeper",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", out)],
    );
    b.output("out", out);
    let hash = engine.store().store(b.image(None)).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let sig = engine
        .run(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(sig.status, SignatureStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resume_refused() {
    let engine = Arc::new(Engine::with_defaults());
    // A Greet that sleeps long enough for the second resume to arrive
    // mid-flight.
    engine.register_module(ModuleDefinition {
        metadata: ComponentMetadata::new("Greet", 1, 0),
        consumes: vec![("name".to_string(), CType::String)],
        produces: vec![("greeting".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(|inputs, _ctx| async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            let name = match inputs.get("name") {
                Some(RawValue::String(s)) => s.clone(),
                _ => String::new(),
            };
            Ok(ModuleOutcome::Completed(
                [(
                    "greeting".to_string(),
                    RawValue::String(format!("Hello, {name}")),
                )]
                .into_iter()
                .collect(),
            ))
        }),
    });
    let hash = engine.store().store(greeting_pipeline()).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let sig = engine
        .run(&loaded, HashMap::new(), ExecutionOptions::default())
        .await
        .unwrap();
    let snapshot = Arc::new(sig.suspended_state.expect("suspended"));

    let first = {
        let engine = Arc::clone(&engine);
        let snapshot = Arc::clone(&snapshot);
        tokio::spawn(async move {
            engine
                .resume(
                    &snapshot,
                    inputs(vec![("name", CValue::String("Ada".to_string()))]),
                    HashMap::new(),
                    ExecutionOptions::default(),
                )
                .await
        })
    };
    // Give the first resume time to claim the execution id.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = engine
        .resume(
            &snapshot,
            inputs(vec![("name", CValue::String("Eve".to_string()))]),
            HashMap::new(),
            ExecutionOptions::default(),
        )
        .await;
    match second {
        Err(e) => assert!(e.to_string().contains("already in progress")),
        Ok(_) => panic!("second concurrent resume should be refused"),
    }

    let first = first.await.expect("task").expect("first resume succeeds");
    assert_eq!(first.status, SignatureStatus::Completed);
}

#[tokio::test]
async fn test_priority_orders_serial_execution() {
    // With a single worker, priorities decide who runs first.
    let mut config = constellation::Config::default();
    config.engine.worker_threads = 1;
    let engine = Engine::new(config).unwrap();

    let order: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for name in ["Low", "High"] {
        let order = Arc::clone(&order);
        let name_owned = name.to_string();
        engine.register_module(ModuleDefinition {
            metadata: ComponentMetadata::new(name, 1, 0),
            consumes: vec![("text".to_string(), CType::String)],
            produces: vec![("result".to_string(), CType::String)],
            config: Default::default(),
            http_config: None,
            body: module_fn(move |_inputs, _ctx| {
                let order = Arc::clone(&order);
                let name = name_owned.clone();
                async move {
                    order.lock().push(name);
                    Ok(ModuleOutcome::Completed(
                        [("result".to_string(), RawValue::String(String::new()))]
                            .into_iter()
                            .collect(),
                    ))
                }
            }),
        });
    }

    let mut b = DagBuilder::new("priorities");
    let input = b.data("in", CType::String);
    let low_out = b.data("low_out", CType::String);
    let high_out = b.data("high_out", CType::String);
    let low = b.module(
        module_spec(
            "Low",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", low_out)],
    );
    let high = b.module(
        module_spec(
            "High",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", high_out)],
    );
    b.with_options(
        low,
        ModuleCallOptions {
            priority: Some(10),
            ..ModuleCallOptions::default()
        },
    );
    b.with_options(
        high,
        ModuleCallOptions {
            priority: Some(90),
            ..ModuleCallOptions::default()
        },
    );
    b.output("low_out", low_out);
    b.output("high_out", high_out);
    let hash = engine.store().store(b.image(None)).unwrap();
    let loaded = engine.load_ref(&format!("sha256:{hash}")).unwrap();

    let sig = engine
        .run(
            &loaded,
            inputs(vec![("in", CValue::String("x".to_string()))]),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(sig.status, SignatureStatus::Completed);
    assert_eq!(*order.lock(), vec!["High".to_string(), "Low".to_string()]);
}
