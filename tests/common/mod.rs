//! Shared test fixtures: a small DAG builder and stock modules.

#![allow(dead_code)]

use constellation::{
    module_fn, CType, ComponentMetadata, DagSpec, DataNodeSpec, InlineTransform,
    ModuleCallOptions, ModuleDefinition, ModuleFailure, ModuleNodeSpec, ModuleOutcome,
    PipelineImage, RawValue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Incremental `DagSpec` construction with automatic edge and nickname
/// wiring.
pub struct DagBuilder {
    dag: DagSpec,
    options: HashMap<Uuid, ModuleCallOptions>,
}

impl DagBuilder {
    pub fn new(name: &str) -> Self {
        DagBuilder {
            dag: DagSpec::new(ComponentMetadata::new(name, 1, 0)),
            options: HashMap::new(),
        }
    }

    /// Plain data node (user input when nothing produces it).
    pub fn data(&mut self, name: &str, ctype: CType) -> Uuid {
        let id = Uuid::new_v4();
        self.dag.data.insert(id, DataNodeSpec::new(name, ctype));
        id
    }

    /// Data node computed by an inline transform.
    pub fn transform(
        &mut self,
        name: &str,
        ctype: CType,
        transform: InlineTransform,
        inputs: &[(&str, Uuid)],
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.dag.data.insert(
            id,
            DataNodeSpec::new(name, ctype).with_transform(
                transform,
                inputs
                    .iter()
                    .map(|(n, d)| ((*n).to_string(), *d))
                    .collect::<Vec<_>>(),
            ),
        );
        id
    }

    /// Module node wired to existing data nodes by parameter/field name.
    pub fn module(
        &mut self,
        spec: ModuleNodeSpec,
        inputs: &[(&str, Uuid)],
        outputs: &[(&str, Uuid)],
    ) -> Uuid {
        let id = Uuid::new_v4();
        for (param, data) in inputs {
            self.dag.in_edges.insert((*data, id));
            if let Some(node) = self.dag.data.get_mut(data) {
                node.nicknames.insert(id, (*param).to_string());
            }
        }
        for (field, data) in outputs {
            self.dag.out_edges.insert((id, *data));
            if let Some(node) = self.dag.data.get_mut(data) {
                node.nicknames.insert(id, (*field).to_string());
            }
        }
        self.dag.modules.insert(id, spec);
        id
    }

    pub fn with_options(&mut self, module: Uuid, options: ModuleCallOptions) {
        self.options.insert(module, options);
    }

    pub fn output(&mut self, name: &str, data: Uuid) {
        self.dag.declared_outputs.push(name.to_string());
        self.dag.output_bindings.insert(name.to_string(), data);
    }

    pub fn image(self, source: Option<&[u8]>) -> PipelineImage {
        PipelineImage::build(self.dag, self.options, source).expect("test DAG is valid")
    }

    pub fn into_parts(self) -> (DagSpec, HashMap<Uuid, ModuleCallOptions>) {
        (self.dag, self.options)
    }
}

pub fn module_spec(name: &str, consumes: &[(&str, CType)], produces: &[(&str, CType)]) -> ModuleNodeSpec {
    ModuleNodeSpec::new(
        ComponentMetadata::new(name, 1, 0),
        consumes
            .iter()
            .map(|(n, t)| ((*n).to_string(), t.clone()))
            .collect(),
        produces
            .iter()
            .map(|(n, t)| ((*n).to_string(), t.clone()))
            .collect(),
    )
}

fn string_input(inputs: &HashMap<String, RawValue>, name: &str) -> Result<String, ModuleFailure> {
    match inputs.get(name) {
        Some(RawValue::String(s)) => Ok(s.clone()),
        other => Err(ModuleFailure::fatal(format!(
            "input '{name}' is not a string: {other:?}"
        ))),
    }
}

fn record(pairs: Vec<(&str, RawValue)>) -> HashMap<String, RawValue> {
    pairs.into_iter().map(|(n, v)| (n.to_string(), v)).collect()
}

/// `Upper(text: String) -> {result: String}`
pub fn upper_module() -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new("Upper", 1, 0),
        consumes: vec![("text".to_string(), CType::String)],
        produces: vec![("result".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(|inputs, _ctx| async move {
            let text = string_input(&inputs, "text")?;
            Ok(ModuleOutcome::Completed(record(vec![(
                "result",
                RawValue::String(text.to_uppercase()),
            )])))
        }),
    }
}

/// `Prefix(text: String, p: String) -> {out: String}` returning `p + text`
pub fn prefix_module() -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new("Prefix", 1, 0),
        consumes: vec![
            ("text".to_string(), CType::String),
            ("p".to_string(), CType::String),
        ],
        produces: vec![("out".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(|inputs, _ctx| async move {
            let text = string_input(&inputs, "text")?;
            let p = string_input(&inputs, "p")?;
            Ok(ModuleOutcome::Completed(record(vec![(
                "out",
                RawValue::String(format!("{p}{text}")),
            )])))
        }),
    }
}

/// `Greet(name: String) -> {greeting: String}` returning `"Hello, " + name`
pub fn greet_module() -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new("Greet", 1, 0),
        consumes: vec![("name".to_string(), CType::String)],
        produces: vec![("greeting".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(|inputs, _ctx| async move {
            let name = string_input(&inputs, "name")?;
            Ok(ModuleOutcome::Completed(record(vec![(
                "greeting",
                RawValue::String(format!("Hello, {name}")),
            )])))
        }),
    }
}

/// A module that fails retriably until `succeed_on_attempt`, then echoes
/// its input. The shared counter records total invocations.
pub fn flaky_module(succeed_on_attempt: u32, calls: Arc<AtomicU32>) -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new("Flaky", 1, 0),
        consumes: vec![("text".to_string(), CType::String)],
        produces: vec![("result".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(move |inputs, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < succeed_on_attempt {
                    return Err(ModuleFailure::retriable(format!(
                        "transient failure on attempt {attempt}"
                    )));
                }
                let text = string_input(&inputs, "text")?;
                Ok(ModuleOutcome::Completed(record(vec![(
                    "result",
                    RawValue::String(text),
                )])))
            }
        }),
    }
}

/// A module that sleeps in small cooperative slices until cancelled or
/// done.
pub fn sleeper_module(name: &str, total_ms: u64) -> ModuleDefinition {
    ModuleDefinition {
        metadata: ComponentMetadata::new(name, 1, 0),
        consumes: vec![("text".to_string(), CType::String)],
        produces: vec![("result".to_string(), CType::String)],
        config: Default::default(),
        http_config: None,
        body: module_fn(move |inputs, ctx| async move {
            let mut slept = 0;
            while slept < total_ms {
                if ctx.cancel.is_cancelled() {
                    return Err(ModuleFailure::fatal("observed cancellation"));
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                slept += 5;
            }
            let text = string_input(&inputs, "text")?;
            Ok(ModuleOutcome::Completed(record(vec![(
                "result",
                RawValue::String(text),
            )])))
        }),
    }
}

/// The linear two-module pipeline of the engine's happy path:
/// `in:String -> Upper -> Prefix(p = constant) -> out`.
pub fn linear_pipeline(prefix: &str) -> PipelineImage {
    let mut b = DagBuilder::new("linear");
    let input = b.data("in", CType::String);
    let mid = b.data("mid", CType::String);
    let p = b.transform(
        "p",
        CType::String,
        InlineTransform::Constant {
            value: constellation::CValue::String(prefix.to_string()),
        },
        &[],
    );
    let out = b.data("out", CType::String);
    b.module(
        module_spec(
            "Upper",
            &[("text", CType::String)],
            &[("result", CType::String)],
        ),
        &[("text", input)],
        &[("result", mid)],
    );
    b.module(
        module_spec(
            "Prefix",
            &[("text", CType::String), ("p", CType::String)],
            &[("out", CType::String)],
        ),
        &[("text", mid), ("p", p)],
        &[("out", out)],
    );
    b.output("out", out);
    b.image(Some(b"pipeline linear { upper |> prefix }"))
}

/// `name:String -> Greet -> greeting`, for suspension tests.
pub fn greeting_pipeline() -> PipelineImage {
    let mut b = DagBuilder::new("greeting");
    let name = b.data("name", CType::String);
    let greeting = b.data("greeting", CType::String);
    b.module(
        module_spec(
            "Greet",
            &[("name", CType::String)],
            &[("greeting", CType::String)],
        ),
        &[("name", name)],
        &[("greeting", greeting)],
    );
    b.output("greeting", greeting);
    b.image(Some(b"pipeline greeting { greet }"))
}
