//! DAG Load-Time Validation
//!
//! Checks the structural invariants a `DagSpec` must satisfy before the
//! engine will execute it. Violations are accumulated so a rejected
//! pipeline reports everything wrong with it at once; missing nodes and
//! cycles short-circuit because later checks would only cascade.

use super::{DagSpec, InlineTransform, TransformExpr};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// One failed invariant check.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Which invariant failed
    pub invariant: &'static str,
    pub message: String,
}

/// Why a `DagSpec` was rejected at load.
#[derive(Debug, thiserror::Error)]
pub enum DagValidationError {
    /// An edge or binding references a UUID missing from the spec
    #[error("Node not found: {referenced} referenced by {by}")]
    NodeNotFound { referenced: Uuid, by: String },

    /// The graph contains a cycle
    #[error("Cycle detected involving: {}", involved.join(", "))]
    CycleDetected { involved: Vec<String> },

    /// One or more invariants violated
    #[error("DAG validation failed: {}", violations.iter().map(|v| format!("[{}] {}", v.invariant, v.message)).collect::<Vec<_>>().join("; "))]
    Invalid { violations: Vec<Violation> },
}

/// Validate every load-time invariant of a `DagSpec`.
pub fn validate_dag(dag: &DagSpec) -> Result<(), DagValidationError> {
    check_references(dag)?;
    check_acyclic(dag)?;

    let mut violations = Vec::new();
    check_single_writer(dag, &mut violations);
    check_output_bindings(dag, &mut violations);
    check_consumes_types(dag, &mut violations);
    check_produces_types(dag, &mut violations);
    check_transform_inputs(dag, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(DagValidationError::Invalid { violations })
    }
}

/// Invariant 1: every UUID referenced by any edge or binding exists.
fn check_references(dag: &DagSpec) -> Result<(), DagValidationError> {
    for (data, module) in &dag.in_edges {
        if !dag.data.contains_key(data) {
            return Err(DagValidationError::NodeNotFound {
                referenced: *data,
                by: format!("in-edge into module {module}"),
            });
        }
        if !dag.modules.contains_key(module) {
            return Err(DagValidationError::NodeNotFound {
                referenced: *module,
                by: format!("in-edge from data {data}"),
            });
        }
    }
    for (module, data) in &dag.out_edges {
        if !dag.modules.contains_key(module) {
            return Err(DagValidationError::NodeNotFound {
                referenced: *module,
                by: format!("out-edge into data {data}"),
            });
        }
        if !dag.data.contains_key(data) {
            return Err(DagValidationError::NodeNotFound {
                referenced: *data,
                by: format!("out-edge from module {module}"),
            });
        }
    }
    for (name, data) in &dag.output_bindings {
        if !dag.data.contains_key(data) {
            return Err(DagValidationError::NodeNotFound {
                referenced: *data,
                by: format!("output binding '{name}'"),
            });
        }
    }
    for (id, node) in &dag.data {
        for (input_name, input) in &node.transform_inputs {
            if !dag.data.contains_key(input) {
                return Err(DagValidationError::NodeNotFound {
                    referenced: *input,
                    by: format!("transform input '{input_name}' of data node '{}' ({id})", node.name),
                });
            }
        }
    }
    Ok(())
}

/// Invariant 4: the graph of modules, data nodes and transform edges is
/// acyclic. Kahn's algorithm; whatever survives peeling is on a cycle.
fn check_acyclic(dag: &DagSpec) -> Result<(), DagValidationError> {
    let mut successors: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut in_degree: HashMap<Uuid, usize> = HashMap::new();

    for id in dag.modules.keys().chain(dag.data.keys()) {
        in_degree.entry(*id).or_insert(0);
    }
    let mut add_edge = |from: Uuid, to: Uuid| {
        successors.entry(from).or_default().push(to);
        *in_degree.entry(to).or_insert(0) += 1;
    };
    for (data, module) in &dag.in_edges {
        add_edge(*data, *module);
    }
    for (module, data) in &dag.out_edges {
        add_edge(*module, *data);
    }
    for (id, node) in &dag.data {
        for input in node.transform_inputs.values() {
            add_edge(*input, *id);
        }
    }

    let mut queue: Vec<Uuid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut peeled: HashSet<Uuid> = HashSet::new();
    while let Some(id) = queue.pop() {
        peeled.insert(id);
        if let Some(next) = successors.get(&id) {
            for succ in next {
                let d = in_degree.get_mut(succ).expect("successor is a known node");
                *d -= 1;
                if *d == 0 {
                    queue.push(*succ);
                }
            }
        }
    }

    if peeled.len() == in_degree.len() {
        return Ok(());
    }
    let mut involved: Vec<String> = in_degree
        .keys()
        .filter(|id| !peeled.contains(id))
        .map(|id| {
            dag.modules
                .get(id)
                .map(|m| format!("module '{}'", m.metadata.name))
                .or_else(|| dag.data.get(id).map(|d| format!("data '{}'", d.name)))
                .unwrap_or_else(|| id.to_string())
        })
        .collect();
    involved.sort();
    Err(DagValidationError::CycleDetected { involved })
}

/// Invariant 2: every data node is the target of at most one out-edge.
fn check_single_writer(dag: &DagSpec, violations: &mut Vec<Violation>) {
    let mut writers: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (module, data) in &dag.out_edges {
        writers.entry(*data).or_default().push(*module);
    }
    for (data, ws) in writers {
        let node = &dag.data[&data];
        if ws.len() > 1 {
            violations.push(Violation {
                invariant: "single-writer",
                message: format!("data node '{}' has {} writers", node.name, ws.len()),
            });
        }
        if node.inline_transform.is_some() {
            violations.push(Violation {
                invariant: "single-writer",
                message: format!(
                    "data node '{}' has both a producing module and an inline transform",
                    node.name
                ),
            });
        }
    }
}

/// Invariant 3: every declared output resolves through the bindings.
fn check_output_bindings(dag: &DagSpec, violations: &mut Vec<Violation>) {
    for name in &dag.declared_outputs {
        if !dag.output_bindings.contains_key(name) {
            violations.push(Violation {
                invariant: "output-binding",
                message: format!("declared output '{name}' has no binding"),
            });
        }
    }
}

/// Invariant 5 (consume side): a module's `consumes` agrees with the types
/// of the data nodes wired to it through the nickname mapping.
fn check_consumes_types(dag: &DagSpec, violations: &mut Vec<Violation>) {
    for (module_id, module) in &dag.modules {
        for (param, bound) in dag.inputs_of(*module_id) {
            let Some(data_id) = bound else {
                violations.push(Violation {
                    invariant: "consumes-wiring",
                    message: format!(
                        "module '{}' parameter '{}' is not wired to any data node",
                        module.metadata.name, param
                    ),
                });
                continue;
            };
            let declared = module
                .consumed_type(&param)
                .expect("param comes from the consumes list");
            let node = &dag.data[&data_id];
            if node.ctype != *declared {
                violations.push(Violation {
                    invariant: "consumes-types",
                    message: format!(
                        "module '{}' parameter '{}' expects {} but data node '{}' is {}",
                        module.metadata.name,
                        param,
                        declared.signature(),
                        node.name,
                        node.ctype.signature()
                    ),
                });
            }
        }
    }
}

/// Invariant 5 (produce side): output bindings agree with declared types.
fn check_produces_types(dag: &DagSpec, violations: &mut Vec<Violation>) {
    for (module_id, module) in &dag.modules {
        for (field, bound) in dag.outputs_of(*module_id) {
            let Some(data_id) = bound else {
                // A module output may legitimately go unconsumed.
                continue;
            };
            let declared = module
                .produced_type(&field)
                .expect("field comes from the produces list");
            let node = &dag.data[&data_id];
            if node.ctype != *declared {
                violations.push(Violation {
                    invariant: "produces-types",
                    message: format!(
                        "module '{}' output '{}' produces {} but data node '{}' is {}",
                        module.metadata.name,
                        field,
                        declared.signature(),
                        node.name,
                        node.ctype.signature()
                    ),
                });
            }
        }
    }
}

/// Invariant 6: `transform_inputs` is non-empty iff `inline_transform` is
/// present (constants, which consume nothing, are the one exception on the
/// non-empty side), and the named inputs cover what the transform reads.
fn check_transform_inputs(dag: &DagSpec, violations: &mut Vec<Violation>) {
    for node in dag.data.values() {
        match &node.inline_transform {
            None => {
                if !node.transform_inputs.is_empty() {
                    violations.push(Violation {
                        invariant: "transform-inputs",
                        message: format!(
                            "data node '{}' has transform inputs but no inline transform",
                            node.name
                        ),
                    });
                }
            }
            Some(transform) => {
                let required = required_inputs(transform);
                if required.is_empty() && !matches!(transform, InlineTransform::Constant { .. }) {
                    violations.push(Violation {
                        invariant: "transform-inputs",
                        message: format!(
                            "inline transform on data node '{}' reads no inputs",
                            node.name
                        ),
                    });
                }
                for name in &required {
                    if !node.transform_inputs.contains_key(name) {
                        violations.push(Violation {
                            invariant: "transform-inputs",
                            message: format!(
                                "inline transform on data node '{}' reads input '{}' which is not wired",
                                node.name, name
                            ),
                        });
                    }
                }
            }
        }
    }
}

/// The input names an inline transform actually reads.
pub fn required_inputs(transform: &InlineTransform) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    match transform {
        InlineTransform::RecordMerge { inputs }
        | InlineTransform::And { inputs }
        | InlineTransform::Or { inputs } => {
            out.extend(inputs.iter().cloned());
        }
        InlineTransform::FieldProject { input, .. }
        | InlineTransform::FieldAccess { input, .. }
        | InlineTransform::Not { input }
        | InlineTransform::ListFilter { input, .. }
        | InlineTransform::ListMap { input, .. }
        | InlineTransform::ListAll { input, .. }
        | InlineTransform::ListAny { input, .. } => {
            out.insert(input.clone());
        }
        InlineTransform::Conditional {
            condition,
            then_input,
            else_input,
        } => {
            out.insert(condition.clone());
            out.insert(then_input.clone());
            out.insert(else_input.clone());
        }
        InlineTransform::Guarded { guard, value, .. } => {
            collect_vars(guard, &mut out);
            collect_vars(value, &mut out);
        }
        InlineTransform::Constant { .. } => {}
        InlineTransform::Expr { expr } => collect_vars(expr, &mut out),
        InlineTransform::Branch {
            selector,
            arms,
            default,
        } => {
            out.insert(selector.clone());
            out.extend(arms.iter().map(|a| a.input.clone()));
            if let Some(d) = default {
                out.insert(d.clone());
            }
        }
    }
    // List predicates may also read named inputs besides the element.
    match transform {
        InlineTransform::ListFilter { predicate, .. }
        | InlineTransform::ListAll { predicate, .. }
        | InlineTransform::ListAny { predicate, .. } => collect_vars(predicate, &mut out),
        InlineTransform::ListMap { expr, .. } => collect_vars(expr, &mut out),
        _ => {}
    }
    out
}

fn collect_vars(expr: &TransformExpr, out: &mut BTreeSet<String>) {
    match expr {
        TransformExpr::Elem | TransformExpr::Const(_) => {}
        TransformExpr::Var(name) => {
            out.insert(name.clone());
        }
        TransformExpr::Field(base, _) => collect_vars(base, out),
        TransformExpr::Compare { lhs, rhs, .. } | TransformExpr::Arith { lhs, rhs, .. } => {
            collect_vars(lhs, out);
            collect_vars(rhs, out);
        }
        TransformExpr::And(l, r) | TransformExpr::Or(l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
        TransformExpr::Not(e) => collect_vars(e, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ComponentMetadata, DataNodeSpec, ModuleNodeSpec};
    use crate::value::CType;

    fn simple_module(name: &str) -> ModuleNodeSpec {
        ModuleNodeSpec::new(
            ComponentMetadata::new(name, 1, 0),
            vec![("text".to_string(), CType::String)],
            vec![("result".to_string(), CType::String)],
        )
    }

    fn linear_dag() -> (DagSpec, Uuid, Uuid, Uuid) {
        let mut dag = DagSpec::new(ComponentMetadata::new("pipeline", 1, 0));
        let in_id = Uuid::new_v4();
        let out_id = Uuid::new_v4();
        let module_id = Uuid::new_v4();

        let mut in_node = DataNodeSpec::new("text", CType::String);
        in_node.nicknames.insert(module_id, "text".to_string());
        let mut out_node = DataNodeSpec::new("result", CType::String);
        out_node.nicknames.insert(module_id, "result".to_string());

        dag.data.insert(in_id, in_node);
        dag.data.insert(out_id, out_node);
        dag.modules.insert(module_id, simple_module("Upper"));
        dag.in_edges.insert((in_id, module_id));
        dag.out_edges.insert((module_id, out_id));
        dag.declared_outputs.push("result".to_string());
        dag.output_bindings.insert("result".to_string(), out_id);
        (dag, in_id, out_id, module_id)
    }

    #[test]
    fn test_valid_linear_dag() {
        let (dag, _, _, _) = linear_dag();
        validate_dag(&dag).unwrap();
    }

    #[test]
    fn test_missing_node_reference() {
        let (mut dag, _, _, module_id) = linear_dag();
        let ghost = Uuid::new_v4();
        dag.in_edges.insert((ghost, module_id));
        let err = validate_dag(&dag).unwrap_err();
        assert!(matches!(
            err,
            DagValidationError::NodeNotFound { referenced, .. } if referenced == ghost
        ));
    }

    #[test]
    fn test_cycle_via_transform_is_rejected() {
        // Module consumes D; D computed by a transform reading the module's output.
        let (mut dag, in_id, out_id, _) = linear_dag();
        let node = dag.data.get_mut(&in_id).expect("input node exists");
        node.inline_transform = Some(InlineTransform::FieldAccess {
            input: "src".to_string(),
            field: "x".to_string(),
        });
        node.transform_inputs.insert("src".to_string(), out_id);

        let err = validate_dag(&dag).unwrap_err();
        match err {
            DagValidationError::CycleDetected { involved } => {
                assert!(involved.iter().any(|n| n.contains("Upper")));
                assert!(involved.iter().any(|n| n.contains("text") || n.contains("result")));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_double_writer_rejected() {
        let (mut dag, in_id, out_id, _) = linear_dag();
        let second = Uuid::new_v4();
        dag.modules.insert(second, simple_module("Second"));
        dag.in_edges.insert((in_id, second));
        dag.out_edges.insert((second, out_id));
        // Nickname the shared nodes for the second module too.
        dag.data
            .get_mut(&in_id)
            .expect("input node exists")
            .nicknames
            .insert(second, "text".to_string());
        dag.data
            .get_mut(&out_id)
            .expect("output node exists")
            .nicknames
            .insert(second, "result".to_string());

        let err = validate_dag(&dag).unwrap_err();
        match err {
            DagValidationError::Invalid { violations } => {
                assert!(violations.iter().any(|v| v.invariant == "single-writer"));
            }
            other => panic!("expected violations, got {other:?}"),
        }
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let (mut dag, in_id, _, _) = linear_dag();
        dag.data.get_mut(&in_id).expect("input node exists").ctype = CType::Int;
        let err = validate_dag(&dag).unwrap_err();
        match err {
            DagValidationError::Invalid { violations } => {
                assert!(violations.iter().any(|v| v.invariant == "consumes-types"));
            }
            other => panic!("expected violations, got {other:?}"),
        }
    }

    #[test]
    fn test_transform_inputs_must_cover_reads() {
        let (mut dag, in_id, _, _) = linear_dag();
        // Break the wiring for a transform that reads 'src'.
        let node = dag.data.get_mut(&in_id).expect("input node exists");
        node.inline_transform = Some(InlineTransform::Not {
            input: "src".to_string(),
        });
        let err = validate_dag(&dag).unwrap_err();
        match err {
            DagValidationError::Invalid { violations } => {
                assert!(violations.iter().any(|v| v.invariant == "transform-inputs"));
            }
            other => panic!("expected violations, got {other:?}"),
        }
    }

    #[test]
    fn test_required_inputs_of_expr() {
        let t = InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: crate::dag::ArithOp::Add,
                lhs: Box::new(TransformExpr::Var("left".to_string())),
                rhs: Box::new(TransformExpr::Var("right".to_string())),
            },
        };
        let req = required_inputs(&t);
        assert_eq!(
            req.into_iter().collect::<Vec<_>>(),
            vec!["left".to_string(), "right".to_string()]
        );
    }
}
