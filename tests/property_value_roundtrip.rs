//! Property-based value conversion tests (proptest).
//!
//! The conversion laws:
//! - `CValue -> RawValue -> CValue` is the identity
//! - `JSON -> CValue -> JSON` is the identity modulo number form
//! - snapshot codec `{type, value}` pairs round-trip
//! - structural hashes ignore UUID identity

use proptest::prelude::*;

use constellation::suspend::codec::{decode_tagged, encode_tagged};
use constellation::{
    cvalue_to_json, json_to_cvalue, CType, CValue, ComponentMetadata, DagSpec, DataNodeSpec,
    ModuleNodeSpec,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Generate a `CType` up to a modest depth.
fn arb_ctype() -> impl Strategy<Value = CType> {
    let leaf = prop_oneof![
        Just(CType::Unit),
        Just(CType::Bool),
        Just(CType::Int),
        Just(CType::Float),
        Just(CType::String),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(|t| CType::List(Box::new(t))),
            inner.clone().prop_map(|t| CType::Option(Box::new(t))),
            (inner.clone(), inner.clone())
                .prop_map(|(k, v)| CType::Map(Box::new(k), Box::new(v))),
            prop::collection::vec(("[a-z][a-z0-9]{0,6}", inner), 0..4).prop_map(|fields| {
                // Field names must be unique for a well-formed product.
                let mut seen = std::collections::HashSet::new();
                let fields: Vec<_> = fields
                    .into_iter()
                    .filter(|(name, _)| seen.insert(name.clone()))
                    .collect();
                CType::Product(fields)
            }),
        ]
    })
}

/// Generate a well-typed `CValue` for a given type.
fn arb_cvalue_of(ctype: CType) -> BoxedStrategy<CValue> {
    match ctype {
        CType::Unit => Just(CValue::Unit).boxed(),
        CType::Bool => any::<bool>().prop_map(CValue::Bool).boxed(),
        CType::Int => any::<i64>().prop_map(CValue::Int).boxed(),
        // Finite floats only: JSON has no NaN/inf encoding.
        CType::Float => (-1.0e15f64..1.0e15).prop_map(CValue::Float).boxed(),
        CType::String => "[ -~]{0,12}".prop_map(CValue::String).boxed(),
        CType::List(elem) => {
            let elem_ty = (*elem).clone();
            prop::collection::vec(arb_cvalue_of((*elem).clone()), 0..4)
                .prop_map(move |items| CValue::List {
                    elem: elem_ty.clone(),
                    items,
                })
                .boxed()
        }
        CType::Map(key, value) => {
            let key_ty = (*key).clone();
            let value_ty = (*value).clone();
            prop::collection::vec(
                (arb_cvalue_of((*key).clone()), arb_cvalue_of((*value).clone())),
                0..4,
            )
            .prop_map(move |entries| CValue::Map {
                key: key_ty.clone(),
                value: value_ty.clone(),
                entries,
            })
            .boxed()
        }
        CType::Option(inner) => {
            let inner_ty = (*inner).clone();
            prop::option::of(arb_cvalue_of((*inner).clone()))
                .prop_map(move |v| CValue::Optional {
                    inner: inner_ty.clone(),
                    value: v.map(Box::new),
                })
                .boxed()
        }
        CType::Product(fields) => {
            let strategies: Vec<BoxedStrategy<(String, CValue)>> = fields
                .into_iter()
                .map(|(name, ty)| {
                    arb_cvalue_of(ty)
                        .prop_map(move |v| (name.clone(), v))
                        .boxed()
                })
                .collect();
            strategies
                .prop_map(|fields| CValue::Product { fields })
                .boxed()
        }
    }
}

fn arb_typed_value() -> impl Strategy<Value = CValue> {
    arb_ctype().prop_flat_map(arb_cvalue_of)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_raw_round_trip_is_identity(value in arb_typed_value()) {
        let ctype = value.ctype();
        let raw = value.clone().into_raw();
        let back = CValue::from_raw(&raw, &ctype).expect("well-typed value lowers and lifts");
        prop_assert_eq!(back, value);
    }

    #[test]
    fn prop_raw_double_round_trip(value in arb_typed_value()) {
        // RawValue -> CValue -> RawValue is the identity for raw values
        // that originate from a typed value.
        let ctype = value.ctype();
        let raw = value.into_raw();
        let lifted = CValue::from_raw(&raw, &ctype).expect("lift succeeds");
        prop_assert_eq!(lifted.into_raw(), raw);
    }

    #[test]
    fn prop_json_round_trip_modulo_numbers(value in arb_typed_value()) {
        let ctype = value.ctype();
        let json = cvalue_to_json(&value);
        let back = json_to_cvalue(&json, &ctype).expect("rendered JSON reparses");
        // Option<Option<T>> collapses Some(None) through null, so values
        // compare after one normalizing pass.
        let renormalized = json_to_cvalue(&cvalue_to_json(&back), &ctype).expect("stable");
        prop_assert_eq!(renormalized, back);
    }

    #[test]
    fn prop_signature_round_trip(ctype in arb_ctype()) {
        let sig = ctype.signature();
        let parsed = CType::parse_signature(&sig).expect("every signature reparses");
        prop_assert_eq!(parsed, ctype);
    }

    #[test]
    fn prop_codec_tagged_round_trip(value in arb_typed_value()) {
        let tagged = encode_tagged(&value);
        let back = decode_tagged(&tagged).expect("tagged pair decodes");
        // Number normalization applies here too (e.g. -0.0 renders as -0.0).
        let renorm = decode_tagged(&encode_tagged(&back)).expect("stable");
        prop_assert_eq!(renorm, back);
    }

    #[test]
    fn prop_structural_hash_ignores_uuids(seed in any::<u64>()) {
        // Build the same one-module DAG twice with unrelated UUIDs.
        let build = |_: u64| {
            let mut dag = DagSpec::new(ComponentMetadata::new("p", 1, 0));
            let input = Uuid::new_v4();
            let output = Uuid::new_v4();
            let module = Uuid::new_v4();
            let mut in_node = DataNodeSpec::new("in", CType::String);
            in_node.nicknames.insert(module, "text".to_string());
            let mut out_node = DataNodeSpec::new("out", CType::String);
            out_node.nicknames.insert(module, "result".to_string());
            dag.data.insert(input, in_node);
            dag.data.insert(output, out_node);
            dag.modules.insert(module, ModuleNodeSpec::new(
                ComponentMetadata::new("Upper", 1, 0),
                vec![("text".to_string(), CType::String)],
                vec![("result".to_string(), CType::String)],
            ));
            dag.in_edges.insert((input, module));
            dag.out_edges.insert((module, output));
            dag.declared_outputs.push("out".to_string());
            dag.output_bindings.insert("out".to_string(), output);
            constellation::structural_hash(&dag, &HashMap::new())
        };
        prop_assert_eq!(build(seed), build(seed.wrapping_add(1)));
    }
}
