//! Pipeline DAG Specification
//!
//! The immutable graph a compiled pipeline hands to the engine: module
//! nodes (typed, opaque callables), data nodes (typed slots), the edges
//! wiring them together, and declared outputs.
//!
//! ## Architecture
//!
//! ```text
//! DagSpec
//! ├── modules:  map<UUID -> ModuleNodeSpec>   (consumes/produces, config)
//! ├── data:     map<UUID -> DataNodeSpec>     (type, optional inline transform)
//! ├── in_edges:  set<(data UUID, module UUID)>
//! ├── out_edges: set<(module UUID, data UUID)>
//! └── declared_outputs + output_bindings
//! ```
//!
//! A `DagSpec` is validated once at load ([`validate`]) and canonicalized
//! for content addressing ([`canonical`]). The engine never mutates it.

pub mod canonical;
pub mod validate;

pub use canonical::{structural_hash, syntactic_hash, CanonicalForm};
pub use validate::{validate_dag, DagValidationError, Violation};

use crate::value::{CType, CValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Name, description and version carried by modules and pipelines.
///
/// Names are case-sensitive; versions obey semver ordering on
/// (major, minor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub major: u32,
    pub minor: u32,
}

impl ComponentMetadata {
    pub fn new(name: impl Into<String>, major: u32, minor: u32) -> Self {
        ComponentMetadata {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            major,
            minor,
        }
    }

    /// `name@major.minor`, the form that enters the structural hash.
    pub fn versioned_name(&self) -> String {
        format!("{}@{}.{}", self.name, self.major, self.minor)
    }
}

/// Per-module timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// How long to wait for all inputs before the module gives up
    pub inputs_timeout_ms: u64,
    /// How long one invocation of the module body may run
    pub module_timeout_ms: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            inputs_timeout_ms: 60_000,
            module_timeout_ms: 30_000,
        }
    }
}

/// HTTP exposure flags; the engine only reads `published` for the
/// published-module listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub published: bool,
}

/// Specification of one module node in the DAG.
///
/// `consumes` and `produces` ordering is significant: it drives the
/// canonical signature and the order input indices are emitted in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleNodeSpec {
    pub metadata: ComponentMetadata,
    pub consumes: Vec<(String, CType)>,
    pub produces: Vec<(String, CType)>,
    #[serde(default)]
    pub config: ModuleConfig,
    /// Opaque compiler context; preserved through store and suspension
    /// round-trips, never interpreted by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_context: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_config: Option<HttpConfig>,
}

impl ModuleNodeSpec {
    pub fn new(
        metadata: ComponentMetadata,
        consumes: Vec<(String, CType)>,
        produces: Vec<(String, CType)>,
    ) -> Self {
        ModuleNodeSpec {
            metadata,
            consumes,
            produces,
            config: ModuleConfig::default(),
            definition_context: None,
            http_config: None,
        }
    }

    /// Canonical `(a:Int,b:String)->(out:Float)` signature.
    pub fn type_signature(&self) -> String {
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
        format!("({})->({})", consumes.join(","), produces.join(","))
    }

    pub fn consumed_type(&self, param: &str) -> Option<&CType> {
        self.consumes.iter().find(|(n, _)| n == param).map(|(_, t)| t)
    }

    pub fn produced_type(&self, field: &str) -> Option<&CType> {
        self.produces.iter().find(|(n, _)| n == field).map(|(_, t)| t)
    }
}

/// Specification of one data node in the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNodeSpec {
    pub name: String,
    /// What each consuming module calls this node (module UUID -> param name)
    #[serde(default)]
    pub nicknames: BTreeMap<Uuid, String>,
    pub ctype: CType,
    /// Present iff the node is computed declaratively from `transform_inputs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_transform: Option<InlineTransform>,
    /// Named inputs feeding the inline transform (input name -> data UUID)
    #[serde(default)]
    pub transform_inputs: BTreeMap<String, Uuid>,
}

impl DataNodeSpec {
    pub fn new(name: impl Into<String>, ctype: CType) -> Self {
        DataNodeSpec {
            name: name.into(),
            nicknames: BTreeMap::new(),
            ctype,
            inline_transform: None,
            transform_inputs: BTreeMap::new(),
        }
    }

    pub fn with_transform(
        mut self,
        transform: InlineTransform,
        inputs: impl IntoIterator<Item = (String, Uuid)>,
    ) -> Self {
        self.inline_transform = Some(transform);
        self.transform_inputs = inputs.into_iter().collect();
        self
    }
}

/// Comparison operators usable inside transform expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Arithmetic operators usable inside transform expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Declarative, closure-free expression tree.
///
/// This is the only computation an inline transform may carry: it
/// serializes, so it survives suspension snapshots. Anything needing a
/// user closure must be wrapped as a module instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformExpr {
    /// The current list element (valid only inside list operations)
    Elem,
    /// A named transform input
    Var(String),
    /// Field of a product value
    Field(Box<TransformExpr>, String),
    /// Literal
    Const(CValue),
    Compare {
        op: CmpOp,
        lhs: Box<TransformExpr>,
        rhs: Box<TransformExpr>,
    },
    Arith {
        op: ArithOp,
        lhs: Box<TransformExpr>,
        rhs: Box<TransformExpr>,
    },
    And(Box<TransformExpr>, Box<TransformExpr>),
    Or(Box<TransformExpr>, Box<TransformExpr>),
    Not(Box<TransformExpr>),
}

impl TransformExpr {
    /// Deterministic single-line rendering; enters the structural hash.
    pub fn fingerprint(&self) -> String {
        match self {
            TransformExpr::Elem => "elem".to_string(),
            TransformExpr::Var(name) => format!("var({name})"),
            TransformExpr::Field(base, field) => {
                format!("field({},{})", base.fingerprint(), field)
            }
            TransformExpr::Const(v) => format!(
                "const({}:{})",
                v.ctype().signature(),
                serde_json::to_string(&crate::value::cvalue_to_json(v)).unwrap_or_default()
            ),
            TransformExpr::Compare { op, lhs, rhs } => format!(
                "cmp({:?},{},{})",
                op,
                lhs.fingerprint(),
                rhs.fingerprint()
            ),
            TransformExpr::Arith { op, lhs, rhs } => format!(
                "arith({:?},{},{})",
                op,
                lhs.fingerprint(),
                rhs.fingerprint()
            ),
            TransformExpr::And(l, r) => format!("and({},{})", l.fingerprint(), r.fingerprint()),
            TransformExpr::Or(l, r) => format!("or({},{})", l.fingerprint(), r.fingerprint()),
            TransformExpr::Not(e) => format!("not({})", e.fingerprint()),
        }
    }
}

/// One arm of a branch transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    /// Selector value this arm matches
    pub case: String,
    /// Transform input forwarded when the arm matches
    pub input: String,
}

/// The closed sum of declarative node-level computations.
///
/// Evaluated by the engine the moment all `transform_inputs` are computed,
/// without scheduling a module. Pure over `RawValue`s; never suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineTransform {
    /// Structural merge of product inputs, later fields winning
    RecordMerge { inputs: Vec<String> },
    /// Keep a subset of fields of one product input
    FieldProject { input: String, fields: Vec<String> },
    /// Extract a single field of one product input
    FieldAccess { input: String, field: String },
    And { inputs: Vec<String> },
    Or { inputs: Vec<String> },
    Not { input: String },
    /// if `condition` then `then_input` else `else_input`
    Conditional {
        condition: String,
        then_input: String,
        else_input: String,
    },
    /// `Some(value)` while `guard` holds, `None` otherwise
    Guarded {
        guard: TransformExpr,
        value: TransformExpr,
        value_type: CType,
    },
    ListFilter {
        input: String,
        predicate: TransformExpr,
    },
    ListMap {
        input: String,
        expr: TransformExpr,
        output_elem: CType,
    },
    ListAll {
        input: String,
        predicate: TransformExpr,
    },
    ListAny {
        input: String,
        predicate: TransformExpr,
    },
    /// Constant literal; takes no inputs
    Constant { value: CValue },
    /// General expression over named inputs
    Expr { expr: TransformExpr },
    /// N-ary typed switch on a string selector
    Branch {
        selector: String,
        arms: Vec<BranchArm>,
        default: Option<String>,
    },
}

impl InlineTransform {
    /// Stable kind tag; used for canonical tie-breaking and diagnostics.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            InlineTransform::RecordMerge { .. } => "record_merge",
            InlineTransform::FieldProject { .. } => "field_project",
            InlineTransform::FieldAccess { .. } => "field_access",
            InlineTransform::And { .. } => "and",
            InlineTransform::Or { .. } => "or",
            InlineTransform::Not { .. } => "not",
            InlineTransform::Conditional { .. } => "conditional",
            InlineTransform::Guarded { .. } => "guarded",
            InlineTransform::ListFilter { .. } => "list_filter",
            InlineTransform::ListMap { .. } => "list_map",
            InlineTransform::ListAll { .. } => "list_all",
            InlineTransform::ListAny { .. } => "list_any",
            InlineTransform::Constant { .. } => "constant",
            InlineTransform::Expr { .. } => "expr",
            InlineTransform::Branch { .. } => "branch",
        }
    }

    /// Deterministic rendering of the whole transform; enters the
    /// structural hash so that behavior changes always change the hash.
    pub fn fingerprint(&self) -> String {
        match self {
            InlineTransform::RecordMerge { inputs } => {
                format!("record_merge[{}]", inputs.join(","))
            }
            InlineTransform::FieldProject { input, fields } => {
                format!("field_project[{}:{}]", input, fields.join(","))
            }
            InlineTransform::FieldAccess { input, field } => {
                format!("field_access[{input}.{field}]")
            }
            InlineTransform::And { inputs } => format!("and[{}]", inputs.join(",")),
            InlineTransform::Or { inputs } => format!("or[{}]", inputs.join(",")),
            InlineTransform::Not { input } => format!("not[{input}]"),
            InlineTransform::Conditional {
                condition,
                then_input,
                else_input,
            } => format!("conditional[{condition}?{then_input}:{else_input}]"),
            InlineTransform::Guarded {
                guard,
                value,
                value_type,
            } => format!(
                "guarded[{}=>{}:{}]",
                guard.fingerprint(),
                value.fingerprint(),
                value_type.signature()
            ),
            InlineTransform::ListFilter { input, predicate } => {
                format!("list_filter[{}:{}]", input, predicate.fingerprint())
            }
            InlineTransform::ListMap {
                input,
                expr,
                output_elem,
            } => format!(
                "list_map[{}:{}->{}]",
                input,
                expr.fingerprint(),
                output_elem.signature()
            ),
            InlineTransform::ListAll { input, predicate } => {
                format!("list_all[{}:{}]", input, predicate.fingerprint())
            }
            InlineTransform::ListAny { input, predicate } => {
                format!("list_any[{}:{}]", input, predicate.fingerprint())
            }
            InlineTransform::Constant { value } => format!(
                "constant[{}:{}]",
                value.ctype().signature(),
                serde_json::to_string(&crate::value::cvalue_to_json(value)).unwrap_or_default()
            ),
            InlineTransform::Expr { expr } => format!("expr[{}]", expr.fingerprint()),
            InlineTransform::Branch {
                selector,
                arms,
                default,
            } => {
                let arm_str: Vec<String> = arms
                    .iter()
                    .map(|a| format!("{}=>{}", a.case, a.input))
                    .collect();
                format!(
                    "branch[{}:{};default={}]",
                    selector,
                    arm_str.join(","),
                    default.as_deref().unwrap_or("-")
                )
            }
        }
    }
}

/// Retry backoff growth curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// What to do when a module exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Mark Failed and cascade-skip dependents
    Fail,
    /// Mark Skipped and continue with the rest of the graph
    Skip,
}

/// Per-module runtime knobs; unset fields inherit engine defaults.
///
/// `window`, `checkpoint_ms`, `join_strategy`, `batch_size` and
/// `batch_timeout_ms` are accepted and preserved through store and
/// suspension round-trips but the engine does not act on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleCallOptions {
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub backoff: Option<BackoffKind>,
    pub cache_ms: Option<u64>,
    pub cache_backend: Option<String>,
    pub throttle_count: Option<u32>,
    pub throttle_per_ms: Option<u64>,
    pub concurrency: Option<u32>,
    pub on_error: Option<OnError>,
    pub lazy_eval: Option<bool>,
    /// 0-100, higher runs first
    pub priority: Option<u8>,
    pub batch_size: Option<u32>,
    pub batch_timeout_ms: Option<u64>,
    pub window: Option<u64>,
    pub checkpoint_ms: Option<u64>,
    pub join_strategy: Option<String>,
}

impl ModuleCallOptions {
    /// Deterministic `(name=value)` rendering, option names in fixed
    /// order, unset options omitted. `-` when nothing is set.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        fn push<T: std::fmt::Display>(parts: &mut Vec<String>, name: &str, v: &Option<T>) {
            if let Some(v) = v {
                parts.push(format!("{name}={v}"));
            }
        }
        push(&mut parts, "backoff", &self.backoff.map(|b| format!("{b:?}").to_lowercase()));
        push(&mut parts, "batch_size", &self.batch_size);
        push(&mut parts, "batch_timeout_ms", &self.batch_timeout_ms);
        push(&mut parts, "cache_backend", &self.cache_backend);
        push(&mut parts, "cache_ms", &self.cache_ms);
        push(&mut parts, "checkpoint_ms", &self.checkpoint_ms);
        push(&mut parts, "concurrency", &self.concurrency);
        push(&mut parts, "delay_ms", &self.delay_ms);
        push(&mut parts, "join_strategy", &self.join_strategy);
        push(&mut parts, "lazy_eval", &self.lazy_eval);
        push(
            &mut parts,
            "on_error",
            &self.on_error.map(|o| format!("{o:?}").to_lowercase()),
        );
        push(&mut parts, "priority", &self.priority);
        push(&mut parts, "retry", &self.retry);
        push(&mut parts, "throttle_count", &self.throttle_count);
        push(&mut parts, "throttle_per_ms", &self.throttle_per_ms);
        push(&mut parts, "timeout_ms", &self.timeout_ms);
        push(&mut parts, "window", &self.window);
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join(",")
        }
    }
}

/// The complete, immutable pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSpec {
    pub metadata: ComponentMetadata,
    pub modules: HashMap<Uuid, ModuleNodeSpec>,
    pub data: HashMap<Uuid, DataNodeSpec>,
    /// (data UUID, module UUID): the module consumes the data node
    pub in_edges: BTreeSet<(Uuid, Uuid)>,
    /// (module UUID, data UUID): the module produces the data node
    pub out_edges: BTreeSet<(Uuid, Uuid)>,
    pub declared_outputs: Vec<String>,
    pub output_bindings: HashMap<String, Uuid>,
}

impl DagSpec {
    pub fn new(metadata: ComponentMetadata) -> Self {
        DagSpec {
            metadata,
            modules: HashMap::new(),
            data: HashMap::new(),
            in_edges: BTreeSet::new(),
            out_edges: BTreeSet::new(),
            declared_outputs: Vec::new(),
            output_bindings: HashMap::new(),
        }
    }

    /// The module writing a data node, if any (single-writer invariant).
    pub fn producer_of(&self, data: Uuid) -> Option<Uuid> {
        self.out_edges
            .iter()
            .find(|(_, d)| *d == data)
            .map(|(m, _)| *m)
    }

    /// Data nodes a module consumes, in the module's `consumes` order.
    ///
    /// Resolution goes through the nickname map: for each declared
    /// parameter, find the in-edge whose data node nicknames this module
    /// with that parameter name.
    pub fn inputs_of(&self, module: Uuid) -> Vec<(String, Option<Uuid>)> {
        let Some(spec) = self.modules.get(&module) else {
            return Vec::new();
        };
        spec.consumes
            .iter()
            .map(|(param, _)| {
                let bound = self.in_edges.iter().find_map(|(d, m)| {
                    if *m != module {
                        return None;
                    }
                    let node = self.data.get(d)?;
                    let nickname = node
                        .nicknames
                        .get(&module)
                        .cloned()
                        .unwrap_or_else(|| node.name.clone());
                    (nickname == *param).then_some(*d)
                });
                (param.clone(), bound)
            })
            .collect()
    }

    /// Data nodes a module produces, in the module's `produces` order.
    pub fn outputs_of(&self, module: Uuid) -> Vec<(String, Option<Uuid>)> {
        let Some(spec) = self.modules.get(&module) else {
            return Vec::new();
        };
        spec.produces
            .iter()
            .map(|(field, _)| {
                let bound = self.out_edges.iter().find_map(|(m, d)| {
                    if *m != module {
                        return None;
                    }
                    let node = self.data.get(d)?;
                    let nickname = node
                        .nicknames
                        .get(&module)
                        .cloned()
                        .unwrap_or_else(|| node.name.clone());
                    (nickname == *field).then_some(*d)
                });
                (field.clone(), bound)
            })
            .collect()
    }

    /// Data nodes with no producing module and no inline transform; their
    /// values must come from the caller (or a resume).
    pub fn input_nodes(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .data
            .iter()
            .filter(|(id, node)| {
                node.inline_transform.is_none() && self.producer_of(**id).is_none()
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_by_key(|id| self.data[id].name.clone());
        ids
    }

    /// Resolve a data node by its user-facing name.
    pub fn data_by_name(&self, name: &str) -> Option<Uuid> {
        self.data
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| *id)
    }
}

/// Immutable, storable pipeline artifact produced by the external
/// compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineImage {
    pub structural_hash: String,
    pub syntactic_hash: String,
    pub dag_spec: DagSpec,
    #[serde(default)]
    pub module_options: HashMap<Uuid, ModuleCallOptions>,
    pub compiled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
}

impl PipelineImage {
    /// Build an image from a validated spec, computing both hashes.
    ///
    /// `source` is the verbatim pipeline source text when available; its
    /// absence leaves the syntactic hash empty.
    pub fn build(
        dag_spec: DagSpec,
        module_options: HashMap<Uuid, ModuleCallOptions>,
        source: Option<&[u8]>,
    ) -> Result<Self, DagValidationError> {
        validate_dag(&dag_spec)?;
        let structural = structural_hash(&dag_spec, &module_options);
        let syntactic = source.map(syntactic_hash).unwrap_or_default();
        Ok(PipelineImage {
            structural_hash: structural,
            syntactic_hash: syntactic,
            dag_spec,
            module_options,
            compiled_at: Utc::now(),
            source_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_name() {
        let meta = ComponentMetadata::new("Upper", 1, 2);
        assert_eq!(meta.versioned_name(), "Upper@1.2");
    }

    #[test]
    fn test_module_type_signature() {
        let spec = ModuleNodeSpec::new(
            ComponentMetadata::new("Prefix", 1, 0),
            vec![
                ("text".to_string(), CType::String),
                ("p".to_string(), CType::String),
            ],
            vec![("out".to_string(), CType::String)],
        );
        assert_eq!(spec.type_signature(), "(text:String,p:String)->(out:String)");
    }

    #[test]
    fn test_options_fingerprint_deterministic() {
        let opts = ModuleCallOptions {
            retry: Some(2),
            backoff: Some(BackoffKind::Exponential),
            delay_ms: Some(10),
            ..ModuleCallOptions::default()
        };
        assert_eq!(
            opts.fingerprint(),
            "backoff=exponential,delay_ms=10,retry=2"
        );
        assert_eq!(ModuleCallOptions::default().fingerprint(), "-");
    }

    #[test]
    fn test_options_round_trip_preserves_ignored_fields() {
        let opts = ModuleCallOptions {
            window: Some(5),
            checkpoint_ms: Some(1000),
            join_strategy: Some("zip".to_string()),
            batch_size: Some(16),
            batch_timeout_ms: Some(250),
            ..ModuleCallOptions::default()
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: ModuleCallOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn test_transform_fingerprints_distinguish_content() {
        let a = InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: ArithOp::Add,
                lhs: Box::new(TransformExpr::Var("left".to_string())),
                rhs: Box::new(TransformExpr::Var("right".to_string())),
            },
        };
        let b = InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: ArithOp::Mul,
                lhs: Box::new(TransformExpr::Var("left".to_string())),
                rhs: Box::new(TransformExpr::Var("right".to_string())),
            },
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.kind_tag(), b.kind_tag());
    }
}
