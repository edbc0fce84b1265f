//! Inline-Transform Evaluation
//!
//! Evaluates the declarative transform sum over the raw values of a data
//! node's wired inputs. Transforms are pure and synchronous: they run on
//! the driver the moment their inputs resolve, without taking a scheduler
//! slot, and they never suspend.
//!
//! Internally the inputs are lifted to typed values (their types come from
//! the owning data nodes), evaluated, and the result is lowered back to
//! the raw layout for the data table.

use crate::dag::{ArithOp, BranchArm, CmpOp, InlineTransform, TransformExpr};
use crate::value::{CType, CValue, RawValue};
use std::collections::HashMap;

/// Transform evaluation error
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("Transform input '{0}' is missing")]
    MissingInput(String),

    #[error("Type error in transform: expected {expected}, got {actual} ({context})")]
    TypeError {
        expected: String,
        actual: String,
        context: String,
    },

    #[error("Branch selector '{selector}' matches no arm and no default is wired")]
    NoBranchArm { selector: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Field '{0}' not present")]
    NoSuchField(String),
}

/// Evaluate a transform over typed inputs, producing a value of
/// `output_type`.
pub fn eval_transform(
    transform: &InlineTransform,
    inputs: &HashMap<String, CValue>,
    output_type: &CType,
) -> Result<RawValue, TransformError> {
    let value = eval_typed(transform, inputs, output_type)?;
    Ok(value.into_raw())
}

fn input<'a>(
    inputs: &'a HashMap<String, CValue>,
    name: &str,
) -> Result<&'a CValue, TransformError> {
    inputs
        .get(name)
        .ok_or_else(|| TransformError::MissingInput(name.to_string()))
}

fn eval_typed(
    transform: &InlineTransform,
    inputs: &HashMap<String, CValue>,
    output_type: &CType,
) -> Result<CValue, TransformError> {
    match transform {
        InlineTransform::RecordMerge {
            inputs: merge_inputs,
        } => {
            let CType::Product(out_fields) = output_type else {
                return Err(type_error(output_type, "record merge", "non-product output"));
            };
            // Later inputs win; the declared output type fixes field order.
            let mut merged: HashMap<String, CValue> = HashMap::new();
            for name in merge_inputs {
                match input(inputs, name)? {
                    CValue::Product { fields } => {
                        for (field, value) in fields {
                            merged.insert(field.clone(), value.clone());
                        }
                    }
                    other => {
                        return Err(type_error(
                            &CType::Product(vec![]),
                            "record merge input",
                            &other.ctype().signature(),
                        ))
                    }
                }
            }
            let mut fields = Vec::with_capacity(out_fields.len());
            for (field, _) in out_fields {
                let value = merged
                    .remove(field)
                    .ok_or_else(|| TransformError::NoSuchField(field.clone()))?;
                fields.push((field.clone(), value));
            }
            Ok(CValue::Product { fields })
        }
        InlineTransform::FieldProject {
            input: name,
            fields: keep,
        } => match input(inputs, name)? {
            CValue::Product { fields } => {
                let mut out = Vec::with_capacity(keep.len());
                for field in keep {
                    let value = fields
                        .iter()
                        .find(|(n, _)| n == field)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| TransformError::NoSuchField(field.clone()))?;
                    out.push((field.clone(), value));
                }
                Ok(CValue::Product { fields: out })
            }
            other => Err(type_error(
                &CType::Product(vec![]),
                "field projection",
                &other.ctype().signature(),
            )),
        },
        InlineTransform::FieldAccess { input: name, field } => match input(inputs, name)? {
            CValue::Product { fields } => fields
                .iter()
                .find(|(n, _)| n == field)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| TransformError::NoSuchField(field.clone())),
            other => Err(type_error(
                &CType::Product(vec![]),
                "field access",
                &other.ctype().signature(),
            )),
        },
        InlineTransform::And {
            inputs: bool_inputs,
        } => {
            let mut acc = true;
            for name in bool_inputs {
                acc = acc && as_bool(input(inputs, name)?, "and")?;
            }
            Ok(CValue::Bool(acc))
        }
        InlineTransform::Or {
            inputs: bool_inputs,
        } => {
            let mut acc = false;
            for name in bool_inputs {
                acc = acc || as_bool(input(inputs, name)?, "or")?;
            }
            Ok(CValue::Bool(acc))
        }
        InlineTransform::Not { input: name } => {
            Ok(CValue::Bool(!as_bool(input(inputs, name)?, "not")?))
        }
        InlineTransform::Conditional {
            condition,
            then_input,
            else_input,
        } => {
            let cond = as_bool(input(inputs, condition)?, "conditional")?;
            let chosen = if cond { then_input } else { else_input };
            Ok(input(inputs, chosen)?.clone())
        }
        InlineTransform::Guarded {
            guard,
            value,
            value_type,
        } => {
            let hold = as_bool(&eval_expr(guard, inputs, None)?, "guard")?;
            if hold {
                let v = eval_expr(value, inputs, None)?;
                Ok(CValue::some(value_type.clone(), v))
            } else {
                Ok(CValue::none(value_type.clone()))
            }
        }
        InlineTransform::ListFilter {
            input: name,
            predicate,
        } => {
            let (elem, items) = as_list(input(inputs, name)?, "list filter")?;
            let mut out = Vec::new();
            for item in items {
                if as_bool(&eval_expr(predicate, inputs, Some(item))?, "filter predicate")? {
                    out.push(item.clone());
                }
            }
            Ok(CValue::List {
                elem: elem.clone(),
                items: out,
            })
        }
        InlineTransform::ListMap {
            input: name,
            expr,
            output_elem,
        } => {
            let (_, items) = as_list(input(inputs, name)?, "list map")?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(expr, inputs, Some(item))?);
            }
            Ok(CValue::List {
                elem: output_elem.clone(),
                items: out,
            })
        }
        InlineTransform::ListAll {
            input: name,
            predicate,
        } => {
            let (_, items) = as_list(input(inputs, name)?, "list all")?;
            for item in items {
                if !as_bool(&eval_expr(predicate, inputs, Some(item))?, "all predicate")? {
                    return Ok(CValue::Bool(false));
                }
            }
            Ok(CValue::Bool(true))
        }
        InlineTransform::ListAny {
            input: name,
            predicate,
        } => {
            let (_, items) = as_list(input(inputs, name)?, "list any")?;
            for item in items {
                if as_bool(&eval_expr(predicate, inputs, Some(item))?, "any predicate")? {
                    return Ok(CValue::Bool(true));
                }
            }
            Ok(CValue::Bool(false))
        }
        InlineTransform::Constant { value } => Ok(value.clone()),
        InlineTransform::Expr { expr } => eval_expr(expr, inputs, None),
        InlineTransform::Branch {
            selector,
            arms,
            default,
        } => {
            let sel = match input(inputs, selector)? {
                CValue::String(s) => s.clone(),
                other => {
                    return Err(type_error(
                        &CType::String,
                        "branch selector",
                        &other.ctype().signature(),
                    ))
                }
            };
            let chosen = arms
                .iter()
                .find(|BranchArm { case, .. }| *case == sel)
                .map(|arm| arm.input.as_str())
                .or(default.as_deref())
                .ok_or(TransformError::NoBranchArm { selector: sel })?;
            Ok(input(inputs, chosen)?.clone())
        }
    }
}

/// Evaluate an expression tree. `elem` binds the current list element
/// inside list operations.
fn eval_expr(
    expr: &TransformExpr,
    inputs: &HashMap<String, CValue>,
    elem: Option<&CValue>,
) -> Result<CValue, TransformError> {
    match expr {
        TransformExpr::Elem => elem.cloned().ok_or_else(|| {
            TransformError::MissingInput("elem (outside a list operation)".to_string())
        }),
        TransformExpr::Var(name) => input(inputs, name).cloned(),
        TransformExpr::Field(base, field) => match eval_expr(base, inputs, elem)? {
            CValue::Product { fields } => fields
                .into_iter()
                .find(|(n, _)| n == field)
                .map(|(_, v)| v)
                .ok_or_else(|| TransformError::NoSuchField(field.clone())),
            other => Err(type_error(
                &CType::Product(vec![]),
                "field expression",
                &other.ctype().signature(),
            )),
        },
        TransformExpr::Const(v) => Ok(v.clone()),
        TransformExpr::Compare { op, lhs, rhs } => {
            let l = eval_expr(lhs, inputs, elem)?;
            let r = eval_expr(rhs, inputs, elem)?;
            compare(*op, &l, &r)
        }
        TransformExpr::Arith { op, lhs, rhs } => {
            let l = eval_expr(lhs, inputs, elem)?;
            let r = eval_expr(rhs, inputs, elem)?;
            arith(*op, &l, &r)
        }
        TransformExpr::And(l, r) => {
            let lv = as_bool(&eval_expr(l, inputs, elem)?, "and")?;
            // Short-circuit keeps the right side from type-erroring when
            // the left already decides.
            if !lv {
                return Ok(CValue::Bool(false));
            }
            Ok(CValue::Bool(as_bool(&eval_expr(r, inputs, elem)?, "and")?))
        }
        TransformExpr::Or(l, r) => {
            let lv = as_bool(&eval_expr(l, inputs, elem)?, "or")?;
            if lv {
                return Ok(CValue::Bool(true));
            }
            Ok(CValue::Bool(as_bool(&eval_expr(r, inputs, elem)?, "or")?))
        }
        TransformExpr::Not(e) => Ok(CValue::Bool(!as_bool(&eval_expr(e, inputs, elem)?, "not")?)),
    }
}

fn compare(op: CmpOp, l: &CValue, r: &CValue) -> Result<CValue, TransformError> {
    use std::cmp::Ordering;
    let ordering = match (l, r) {
        (CValue::Int(a), CValue::Int(b)) => a.cmp(b),
        (CValue::Float(a), CValue::Float(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (CValue::String(a), CValue::String(b)) => a.cmp(b),
        (CValue::Bool(a), CValue::Bool(b)) => a.cmp(b),
        _ => {
            // Structural equality still works across any same-typed pair.
            return match op {
                CmpOp::Eq => Ok(CValue::Bool(l == r)),
                CmpOp::Ne => Ok(CValue::Bool(l != r)),
                _ => Err(type_error(
                    &l.ctype(),
                    "ordering comparison",
                    &r.ctype().signature(),
                )),
            };
        }
    };
    let result = match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    };
    Ok(CValue::Bool(result))
}

fn arith(op: ArithOp, l: &CValue, r: &CValue) -> Result<CValue, TransformError> {
    match (l, r) {
        (CValue::Int(a), CValue::Int(b)) => {
            let v = match op {
                ArithOp::Add => a.wrapping_add(*b),
                ArithOp::Sub => a.wrapping_sub(*b),
                ArithOp::Mul => a.wrapping_mul(*b),
                ArithOp::Div => {
                    if *b == 0 {
                        return Err(TransformError::DivisionByZero);
                    }
                    a.wrapping_div(*b)
                }
            };
            Ok(CValue::Int(v))
        }
        (CValue::Float(a), CValue::Float(b)) => {
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
            };
            Ok(CValue::Float(v))
        }
        (CValue::String(a), CValue::String(b)) if op == ArithOp::Add => {
            Ok(CValue::String(format!("{a}{b}")))
        }
        _ => Err(type_error(
            &l.ctype(),
            "arithmetic",
            &r.ctype().signature(),
        )),
    }
}

fn as_bool(v: &CValue, context: &str) -> Result<bool, TransformError> {
    match v {
        CValue::Bool(b) => Ok(*b),
        other => Err(type_error(&CType::Bool, context, &other.ctype().signature())),
    }
}

fn as_list<'a>(
    v: &'a CValue,
    context: &str,
) -> Result<(&'a CType, &'a [CValue]), TransformError> {
    match v {
        CValue::List { elem, items } => Ok((elem, items)),
        other => Err(type_error(
            &CType::List(Box::new(CType::Unit)),
            context,
            &other.ctype().signature(),
        )),
    }
}

fn type_error(expected: &CType, context: &str, actual: &str) -> TransformError {
    TransformError::TypeError {
        expected: expected.signature(),
        actual: actual.to_string(),
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_transform() -> InlineTransform {
        InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: ArithOp::Add,
                lhs: Box::new(TransformExpr::Var("left".to_string())),
                rhs: Box::new(TransformExpr::Var("right".to_string())),
            },
        }
    }

    #[test]
    fn test_add_expression() {
        let mut inputs = HashMap::new();
        inputs.insert("left".to_string(), CValue::Int(2));
        inputs.insert("right".to_string(), CValue::Int(3));
        let out = eval_transform(&add_transform(), &inputs, &CType::Int).unwrap();
        assert_eq!(out, RawValue::Int(5));
    }

    #[test]
    fn test_division_by_zero() {
        let t = InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: ArithOp::Div,
                lhs: Box::new(TransformExpr::Var("left".to_string())),
                rhs: Box::new(TransformExpr::Const(CValue::Int(0))),
            },
        };
        let mut inputs = HashMap::new();
        inputs.insert("left".to_string(), CValue::Int(10));
        assert!(matches!(
            eval_transform(&t, &inputs, &CType::Int),
            Err(TransformError::DivisionByZero)
        ));
    }

    #[test]
    fn test_record_merge_later_wins() {
        let t = InlineTransform::RecordMerge {
            inputs: vec!["base".to_string(), "patch".to_string()],
        };
        let out_ty = CType::Product(vec![
            ("a".to_string(), CType::Int),
            ("b".to_string(), CType::Int),
        ]);
        let mut inputs = HashMap::new();
        inputs.insert(
            "base".to_string(),
            CValue::product(vec![
                ("a".to_string(), CValue::Int(1)),
                ("b".to_string(), CValue::Int(2)),
            ]),
        );
        inputs.insert(
            "patch".to_string(),
            CValue::product(vec![("b".to_string(), CValue::Int(9))]),
        );
        let out = eval_transform(&t, &inputs, &out_ty).unwrap();
        assert_eq!(out, RawValue::Product(vec![RawValue::Int(1), RawValue::Int(9)]));
    }

    #[test]
    fn test_field_access_and_project() {
        let record = CValue::product(vec![
            ("x".to_string(), CValue::Int(1)),
            ("y".to_string(), CValue::Int(2)),
        ]);
        let mut inputs = HashMap::new();
        inputs.insert("r".to_string(), record);

        let access = InlineTransform::FieldAccess {
            input: "r".to_string(),
            field: "y".to_string(),
        };
        assert_eq!(
            eval_transform(&access, &inputs, &CType::Int).unwrap(),
            RawValue::Int(2)
        );

        let project = InlineTransform::FieldProject {
            input: "r".to_string(),
            fields: vec!["y".to_string()],
        };
        let out_ty = CType::Product(vec![("y".to_string(), CType::Int)]);
        assert_eq!(
            eval_transform(&project, &inputs, &out_ty).unwrap(),
            RawValue::Product(vec![RawValue::Int(2)])
        );
    }

    #[test]
    fn test_list_filter_map_all_any() {
        let mut inputs = HashMap::new();
        inputs.insert(
            "xs".to_string(),
            CValue::list(
                CType::Int,
                vec![CValue::Int(1), CValue::Int(2), CValue::Int(3)],
            ),
        );
        let gt1 = TransformExpr::Compare {
            op: CmpOp::Gt,
            lhs: Box::new(TransformExpr::Elem),
            rhs: Box::new(TransformExpr::Const(CValue::Int(1))),
        };

        let filtered = eval_transform(
            &InlineTransform::ListFilter {
                input: "xs".to_string(),
                predicate: gt1.clone(),
            },
            &inputs,
            &CType::List(Box::new(CType::Int)),
        )
        .unwrap();
        assert_eq!(filtered, RawValue::IntList(vec![2, 3]));

        let doubled = eval_transform(
            &InlineTransform::ListMap {
                input: "xs".to_string(),
                expr: TransformExpr::Arith {
                    op: ArithOp::Mul,
                    lhs: Box::new(TransformExpr::Elem),
                    rhs: Box::new(TransformExpr::Const(CValue::Int(2))),
                },
                output_elem: CType::Int,
            },
            &inputs,
            &CType::List(Box::new(CType::Int)),
        )
        .unwrap();
        assert_eq!(doubled, RawValue::IntList(vec![2, 4, 6]));

        let all = eval_transform(
            &InlineTransform::ListAll {
                input: "xs".to_string(),
                predicate: gt1.clone(),
            },
            &inputs,
            &CType::Bool,
        )
        .unwrap();
        assert_eq!(all, RawValue::Bool(false));

        let any = eval_transform(
            &InlineTransform::ListAny {
                input: "xs".to_string(),
                predicate: gt1,
            },
            &inputs,
            &CType::Bool,
        )
        .unwrap();
        assert_eq!(any, RawValue::Bool(true));
    }

    #[test]
    fn test_conditional_and_branch() {
        let mut inputs = HashMap::new();
        inputs.insert("cond".to_string(), CValue::Bool(true));
        inputs.insert("a".to_string(), CValue::Int(1));
        inputs.insert("b".to_string(), CValue::Int(2));
        let cond = InlineTransform::Conditional {
            condition: "cond".to_string(),
            then_input: "a".to_string(),
            else_input: "b".to_string(),
        };
        assert_eq!(
            eval_transform(&cond, &inputs, &CType::Int).unwrap(),
            RawValue::Int(1)
        );

        inputs.insert("sel".to_string(), CValue::String("beta".to_string()));
        let branch = InlineTransform::Branch {
            selector: "sel".to_string(),
            arms: vec![
                BranchArm {
                    case: "alpha".to_string(),
                    input: "a".to_string(),
                },
                BranchArm {
                    case: "beta".to_string(),
                    input: "b".to_string(),
                },
            ],
            default: None,
        };
        assert_eq!(
            eval_transform(&branch, &inputs, &CType::Int).unwrap(),
            RawValue::Int(2)
        );

        inputs.insert("sel".to_string(), CValue::String("gamma".to_string()));
        assert!(matches!(
            eval_transform(&branch, &inputs, &CType::Int),
            Err(TransformError::NoBranchArm { .. })
        ));
    }

    #[test]
    fn test_guarded_expression() {
        let t = InlineTransform::Guarded {
            guard: TransformExpr::Compare {
                op: CmpOp::Gt,
                lhs: Box::new(TransformExpr::Var("x".to_string())),
                rhs: Box::new(TransformExpr::Const(CValue::Int(0))),
            },
            value: TransformExpr::Var("x".to_string()),
            value_type: CType::Int,
        };
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), CValue::Int(5));
        assert_eq!(
            eval_transform(&t, &inputs, &CType::Option(Box::new(CType::Int))).unwrap(),
            RawValue::Optional(Some(Box::new(RawValue::Int(5))))
        );

        inputs.insert("x".to_string(), CValue::Int(-1));
        assert_eq!(
            eval_transform(&t, &inputs, &CType::Option(Box::new(CType::Int))).unwrap(),
            RawValue::Optional(None)
        );
    }

    #[test]
    fn test_string_concat() {
        let mut inputs = HashMap::new();
        inputs.insert("a".to_string(), CValue::String("Hello, ".to_string()));
        inputs.insert("b".to_string(), CValue::String("Ada".to_string()));
        let t = InlineTransform::Expr {
            expr: TransformExpr::Arith {
                op: ArithOp::Add,
                lhs: Box::new(TransformExpr::Var("a".to_string())),
                rhs: Box::new(TransformExpr::Var("b".to_string())),
            },
        };
        assert_eq!(
            eval_transform(&t, &inputs, &CType::String).unwrap(),
            RawValue::String("Hello, Ada".to_string())
        );
    }
}
