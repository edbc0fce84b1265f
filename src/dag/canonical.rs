//! DAG Canonicalization & Content Hashing
//!
//! Produces the UUID-independent canonical text form of a `DagSpec` and
//! the SHA-256 structural hash over it.
//!
//! ## Canonical form
//!
//! UTF-8, LF line endings. One line per node in topological order:
//!
//! ```text
//! node <local-index> <kind> <name> sig=<canonical type signature> inputs=[i1,i2,...] opts=<fingerprint>
//! ```
//!
//! followed by one `output <name> <local-index>` line per declared output,
//! in source order.
//!
//! Local indices come from a topological traversal with a stable
//! tie-break (node name, then type signature, then inline-transform kind
//! tag), which is what makes the result independent of UUID identity and
//! map iteration order. Description and tag metadata never enter the
//! form; names and versions do.

use super::{DagSpec, ModuleCallOptions};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// The canonical rendering of a DAG plus the node index assignment that
/// produced it.
///
/// The index assignment is reused by the scheduler as its deterministic
/// tie-break, so equal-priority modules run in a reproducible order.
#[derive(Debug, Clone)]
pub struct CanonicalForm {
    /// Canonical text; hashing input
    pub text: String,
    /// UUID -> local index for every module and data node
    pub index_of: HashMap<Uuid, usize>,
}

impl CanonicalForm {
    /// Build the canonical form of a spec with its per-module options.
    pub fn of(dag: &DagSpec, module_options: &HashMap<Uuid, ModuleCallOptions>) -> Self {
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

        // Eligible nodes keyed by (name, signature, transform kind tag):
        // the stable tie-break that severs the hash from UUID identity.
        let sort_key = |id: &Uuid| -> (String, String, String) {
            if let Some(module) = dag.modules.get(id) {
                (
                    module.metadata.versioned_name(),
                    module.type_signature(),
                    String::new(),
                )
            } else {
                let node = &dag.data[id];
                (
                    node.name.clone(),
                    node.ctype.signature(),
                    node.inline_transform
                        .as_ref()
                        .map(|t| t.kind_tag().to_string())
                        .unwrap_or_default(),
                )
            }
        };

        let mut eligible: BTreeSet<(String, String, String, Uuid)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| {
                let (a, b, c) = sort_key(id);
                (a, b, c, *id)
            })
            .collect();

        let mut order: Vec<Uuid> = Vec::with_capacity(in_degree.len());
        let mut index_of: HashMap<Uuid, usize> = HashMap::new();
        while let Some(entry) = eligible.iter().next().cloned() {
            eligible.remove(&entry);
            let id = entry.3;
            index_of.insert(id, order.len());
            order.push(id);
            if let Some(next) = successors.get(&id) {
                for succ in next.clone() {
                    let d = in_degree.get_mut(&succ).expect("successor is a known node");
                    *d -= 1;
                    if *d == 0 {
                        let (a, b, c) = sort_key(&succ);
                        eligible.insert((a, b, c, succ));
                    }
                }
            }
        }
        // A cyclic spec never reaches hashing (validation rejects it), but
        // the canonical form stays total: leftovers append in key order.
        if order.len() < in_degree.len() {
            let mut rest: Vec<(String, String, String, Uuid)> = in_degree
                .keys()
                .filter(|id| !index_of.contains_key(id))
                .map(|id| {
                    let (a, b, c) = sort_key(id);
                    (a, b, c, *id)
                })
                .collect();
            rest.sort();
            for (_, _, _, id) in rest {
                index_of.insert(id, order.len());
                order.push(id);
            }
        }

        let mut text = String::new();
        for id in &order {
            let local = index_of[id];
            if let Some(module) = dag.modules.get(id) {
                let inputs: Vec<String> = dag
                    .inputs_of(*id)
                    .into_iter()
                    .filter_map(|(_, bound)| bound.map(|d| index_of[&d].to_string()))
                    .collect();
                let opts = module_options
                    .get(id)
                    .map(ModuleCallOptions::fingerprint)
                    .unwrap_or_else(|| "-".to_string());
                text.push_str(&format!(
                    "node {} module {} sig={} inputs=[{}] opts={}\n",
                    local,
                    module.metadata.versioned_name(),
                    module.type_signature(),
                    inputs.join(","),
                    opts
                ));
            } else {
                let node = &dag.data[id];
                // Transform inputs iterate name-ordered (BTreeMap).
                let inputs: Vec<String> = node
                    .transform_inputs
                    .values()
                    .map(|d| index_of[d].to_string())
                    .collect();
                let opts = node
                    .inline_transform
                    .as_ref()
                    .map(|t| t.fingerprint())
                    .unwrap_or_else(|| "-".to_string());
                text.push_str(&format!(
                    "node {} data {} sig={} inputs=[{}] opts={}\n",
                    local,
                    node.name,
                    node.ctype.signature(),
                    inputs.join(","),
                    opts
                ));
            }
        }
        for name in &dag.declared_outputs {
            if let Some(data) = dag.output_bindings.get(name) {
                text.push_str(&format!("output {} {}\n", name, index_of[data]));
            }
        }

        CanonicalForm { text, index_of }
    }
}

/// SHA-256 hex digest of the canonical form.
pub fn structural_hash(dag: &DagSpec, module_options: &HashMap<Uuid, ModuleCallOptions>) -> String {
    let form = CanonicalForm::of(dag, module_options);
    let mut hasher = Sha256::new();
    hasher.update(form.text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of the verbatim pipeline source bytes.
///
/// Two syntactically different sources may share a structural hash; this
/// one tells them apart for the compiler's recompilation cache.
pub fn syntactic_hash(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    format!("{:x}", hasher.finalize())
}
