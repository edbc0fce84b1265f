//! # Value Type System
//!
//! Core runtime types and the dual value representation used by the engine.
//!
//! ## Design
//!
//! Values exist in two layouts:
//!
//! - [`CValue`]: self-describing, typed. Used at system boundaries (user
//!   inputs, declared outputs, suspension snapshots). Every variant carries
//!   enough information to report its [`CType`].
//! - [`RawValue`]: untyped, compact. Used inside the execution engine's
//!   data table. Type information lives separately, once per data node, in
//!   the owning `DataNodeSpec`. Lists of primitives are stored as unboxed
//!   backing arrays rather than boxed sums, which is what makes large
//!   numeric collections cheap.
//!
//! Conversions between the two are total in one direction
//! (`CValue -> RawValue`) and type-directed in the other
//! (`RawValue + CType -> CValue`).
//!
//! ## Usage
//!
//! ```rust
//! use constellation::value::{CType, CValue, RawValue};
//!
//! let v = CValue::list(CType::Int, vec![CValue::Int(1), CValue::Int(2)]);
//! let raw = v.clone().into_raw();
//! assert!(matches!(&raw, RawValue::IntList(_)));
//! assert_eq!(CValue::from_raw(&raw, &v.ctype()).unwrap(), v);
//! ```

pub mod json;

pub use json::{
    cvalue_to_json, json_to_cvalue, parse_json_str, ConversionLimits, ConversionStrategy,
    LazyJsonValue,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime type of a pipeline value.
///
/// A closed sum; the engine never sees user-defined type constructors.
/// `Product` field order is significant and participates in
/// canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CType {
    Unit,
    Bool,
    /// 64-bit signed integer
    Int,
    /// IEEE-754 double
    Float,
    String,
    List(Box<CType>),
    Map(Box<CType>, Box<CType>),
    Option(Box<CType>),
    /// Ordered mapping of field name to field type
    Product(Vec<(String, CType)>),
}

impl CType {
    /// Canonical type-signature string.
    ///
    /// Grammar: `Unit | Bool | Int | Float | String | List<T> | Map<K,V>
    /// | Option<T> | Product{k1:T1,k2:T2,...}` with product fields in
    /// declared order. This string is what enters the structural hash and
    /// the suspension wire format.
    pub fn signature(&self) -> String {
        match self {
            CType::Unit => "Unit".to_string(),
            CType::Bool => "Bool".to_string(),
            CType::Int => "Int".to_string(),
            CType::Float => "Float".to_string(),
            CType::String => "String".to_string(),
            CType::List(t) => format!("List<{}>", t.signature()),
            CType::Map(k, v) => format!("Map<{},{}>", k.signature(), v.signature()),
            CType::Option(t) => format!("Option<{}>", t.signature()),
            CType::Product(fields) => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|(name, ty)| format!("{}:{}", name, ty.signature()))
                    .collect();
                format!("Product{{{}}}", inner.join(","))
            }
        }
    }

    /// Parse a canonical type-signature string back into a `CType`.
    ///
    /// Inverse of [`CType::signature`]; used by the suspension codec, which
    /// serializes types as signature strings.
    pub fn parse_signature(input: &str) -> Result<CType, ValueError> {
        let mut parser = SignatureParser::new(input);
        let ty = parser.parse_type()?;
        parser.expect_end()?;
        Ok(ty)
    }

    /// Whether a list of this element type has an unboxed raw layout.
    pub fn has_unboxed_list(&self) -> bool {
        matches!(
            self,
            CType::Int | CType::Float | CType::Bool | CType::String
        )
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Recursive-descent parser for canonical type signatures.
struct SignatureParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> SignatureParser<'a> {
    fn new(input: &'a str) -> Self {
        SignatureParser { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), ValueError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ValueError::SignatureParse {
                input: self.input.to_string(),
                position: self.pos,
                expected: token.to_string(),
            })
        }
    }

    fn expect_end(&mut self) -> Result<(), ValueError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(ValueError::SignatureParse {
                input: self.input.to_string(),
                position: self.pos,
                expected: "end of input".to_string(),
            })
        }
    }

    fn parse_type(&mut self) -> Result<CType, ValueError> {
        if self.eat("Unit") {
            return Ok(CType::Unit);
        }
        if self.eat("Bool") {
            return Ok(CType::Bool);
        }
        if self.eat("Int") {
            return Ok(CType::Int);
        }
        if self.eat("Float") {
            return Ok(CType::Float);
        }
        if self.eat("String") {
            return Ok(CType::String);
        }
        if self.eat("List<") {
            let inner = self.parse_type()?;
            self.expect(">")?;
            return Ok(CType::List(Box::new(inner)));
        }
        if self.eat("Map<") {
            let key = self.parse_type()?;
            self.expect(",")?;
            let value = self.parse_type()?;
            self.expect(">")?;
            return Ok(CType::Map(Box::new(key), Box::new(value)));
        }
        if self.eat("Option<") {
            let inner = self.parse_type()?;
            self.expect(">")?;
            return Ok(CType::Option(Box::new(inner)));
        }
        if self.eat("Product{") {
            let mut fields = Vec::new();
            if !self.eat("}") {
                loop {
                    let name = self.parse_field_name()?;
                    self.expect(":")?;
                    let ty = self.parse_type()?;
                    fields.push((name, ty));
                    if self.eat("}") {
                        break;
                    }
                    self.expect(",")?;
                }
            }
            return Ok(CType::Product(fields));
        }
        Err(ValueError::SignatureParse {
            input: self.input.to_string(),
            position: self.pos,
            expected: "type constructor".to_string(),
        })
    }

    fn parse_field_name(&mut self) -> Result<String, ValueError> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| *c == ':')
            .map(|(i, _)| i)
            .ok_or_else(|| ValueError::SignatureParse {
                input: self.input.to_string(),
                position: self.pos,
                expected: "field name followed by ':'".to_string(),
            })?;
        if end == 0 {
            return Err(ValueError::SignatureParse {
                input: self.input.to_string(),
                position: self.pos,
                expected: "non-empty field name".to_string(),
            });
        }
        let name = rest[..end].to_string();
        self.pos += end;
        Ok(name)
    }
}

/// Typed, self-describing value.
///
/// Containers carry their element types so that empty collections and
/// absent options still report a precise [`CType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List {
        elem: CType,
        items: Vec<CValue>,
    },
    Map {
        key: CType,
        value: CType,
        entries: Vec<(CValue, CValue)>,
    },
    Optional {
        inner: CType,
        value: Option<Box<CValue>>,
    },
    Product {
        fields: Vec<(String, CValue)>,
    },
}

impl CValue {
    /// Convenience constructor for a typed list.
    pub fn list(elem: CType, items: Vec<CValue>) -> Self {
        CValue::List { elem, items }
    }

    /// Convenience constructor for a present optional.
    pub fn some(inner: CType, value: CValue) -> Self {
        CValue::Optional {
            inner,
            value: Some(Box::new(value)),
        }
    }

    /// Convenience constructor for an absent optional.
    pub fn none(inner: CType) -> Self {
        CValue::Optional { inner, value: None }
    }

    /// Convenience constructor for a product value.
    pub fn product(fields: Vec<(String, CValue)>) -> Self {
        CValue::Product { fields }
    }

    /// The runtime type of this value.
    pub fn ctype(&self) -> CType {
        match self {
            CValue::Unit => CType::Unit,
            CValue::Bool(_) => CType::Bool,
            CValue::Int(_) => CType::Int,
            CValue::Float(_) => CType::Float,
            CValue::String(_) => CType::String,
            CValue::List { elem, .. } => CType::List(Box::new(elem.clone())),
            CValue::Map { key, value, .. } => {
                CType::Map(Box::new(key.clone()), Box::new(value.clone()))
            }
            CValue::Optional { inner, .. } => CType::Option(Box::new(inner.clone())),
            CValue::Product { fields } => CType::Product(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.ctype()))
                    .collect(),
            ),
        }
    }

    /// Convert into the engine-internal untyped layout.
    ///
    /// Primitive lists collapse into unboxed backing arrays; products drop
    /// their field names and keep an ordered slot array. The declared
    /// `CType` of the owning data node is what makes the result readable.
    pub fn into_raw(self) -> RawValue {
        match self {
            CValue::Unit => RawValue::Unit,
            CValue::Bool(b) => RawValue::Bool(b),
            CValue::Int(i) => RawValue::Int(i),
            CValue::Float(f) => RawValue::Float(f),
            CValue::String(s) => RawValue::String(s),
            CValue::List { elem, items } => Self::list_into_raw(&elem, items),
            CValue::Map { entries, .. } => RawValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into_raw(), v.into_raw()))
                    .collect(),
            ),
            CValue::Optional { value, .. } => {
                RawValue::Optional(value.map(|v| Box::new(v.into_raw())))
            }
            CValue::Product { fields } => {
                RawValue::Product(fields.into_iter().map(|(_, v)| v.into_raw()).collect())
            }
        }
    }

    /// Unbox a homogeneous primitive list; a heterogeneous list (possible
    /// only for a malformed `CValue`) falls back to the boxed layout so the
    /// conversion stays total.
    fn list_into_raw(elem: &CType, items: Vec<CValue>) -> RawValue {
        match elem {
            CType::Int if items.iter().all(|v| matches!(v, CValue::Int(_))) => RawValue::IntList(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        CValue::Int(i) => Some(i),
                        _ => None,
                    })
                    .collect(),
            ),
            CType::Float if items.iter().all(|v| matches!(v, CValue::Float(_))) => {
                RawValue::FloatList(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            CValue::Float(f) => Some(f),
                            _ => None,
                        })
                        .collect(),
                )
            }
            CType::Bool if items.iter().all(|v| matches!(v, CValue::Bool(_))) => {
                RawValue::BoolList(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            CValue::Bool(b) => Some(b),
                            _ => None,
                        })
                        .collect(),
                )
            }
            CType::String if items.iter().all(|v| matches!(v, CValue::String(_))) => {
                RawValue::StringList(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            CValue::String(s) => Some(s),
                            _ => None,
                        })
                        .collect(),
                )
            }
            _ => RawValue::List(items.into_iter().map(CValue::into_raw).collect()),
        }
    }

    /// Rebuild a typed value from the untyped layout, guided by the
    /// declared type.
    ///
    /// Fails with [`ValueError::TypeMismatch`] when the raw shape does not
    /// agree with `ctype`.
    pub fn from_raw(raw: &RawValue, ctype: &CType) -> Result<CValue, ValueError> {
        match (ctype, raw) {
            (CType::Unit, RawValue::Unit) => Ok(CValue::Unit),
            (CType::Bool, RawValue::Bool(b)) => Ok(CValue::Bool(*b)),
            (CType::Int, RawValue::Int(i)) => Ok(CValue::Int(*i)),
            (CType::Float, RawValue::Float(f)) => Ok(CValue::Float(*f)),
            (CType::String, RawValue::String(s)) => Ok(CValue::String(s.clone())),
            (CType::List(elem), raw) => Self::list_from_raw(raw, elem),
            (CType::Map(key, value), RawValue::Map(entries)) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((Self::from_raw(k, key)?, Self::from_raw(v, value)?));
                }
                Ok(CValue::Map {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries: out,
                })
            }
            (CType::Option(inner), RawValue::Optional(value)) => Ok(CValue::Optional {
                inner: (**inner).clone(),
                value: match value {
                    Some(v) => Some(Box::new(Self::from_raw(v, inner)?)),
                    None => None,
                },
            }),
            (CType::Product(field_types), RawValue::Product(slots)) => {
                if field_types.len() != slots.len() {
                    return Err(ValueError::TypeMismatch {
                        expected: ctype.signature(),
                        actual: format!("product with {} slots", slots.len()),
                        context: "product arity".to_string(),
                    });
                }
                let mut fields = Vec::with_capacity(slots.len());
                for ((name, field_ty), slot) in field_types.iter().zip(slots) {
                    fields.push((name.clone(), Self::from_raw(slot, field_ty)?));
                }
                Ok(CValue::Product { fields })
            }
            (expected, actual) => Err(ValueError::TypeMismatch {
                expected: expected.signature(),
                actual: actual.kind_name().to_string(),
                context: "raw value reconstruction".to_string(),
            }),
        }
    }

    fn list_from_raw(raw: &RawValue, elem: &CType) -> Result<CValue, ValueError> {
        let items = match (elem, raw) {
            (CType::Int, RawValue::IntList(xs)) => xs.iter().map(|i| CValue::Int(*i)).collect(),
            (CType::Float, RawValue::FloatList(xs)) => {
                xs.iter().map(|f| CValue::Float(*f)).collect()
            }
            (CType::Bool, RawValue::BoolList(xs)) => xs.iter().map(|b| CValue::Bool(*b)).collect(),
            (CType::String, RawValue::StringList(xs)) => {
                xs.iter().map(|s| CValue::String(s.clone())).collect()
            }
            (_, RawValue::List(xs)) => {
                let mut items = Vec::with_capacity(xs.len());
                for x in xs {
                    items.push(Self::from_raw(x, elem)?);
                }
                items
            }
            (_, actual) => {
                return Err(ValueError::TypeMismatch {
                    expected: format!("List<{}>", elem.signature()),
                    actual: actual.kind_name().to_string(),
                    context: "list reconstruction".to_string(),
                })
            }
        };
        Ok(CValue::List {
            elem: elem.clone(),
            items,
        })
    }
}

/// Untyped engine-internal value.
///
/// Primitive lists are unboxed; everything else mirrors [`CValue`] minus
/// the type annotations. A `RawValue` is only meaningful next to the
/// `CType` of the data node that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Unboxed backing array for `List<Int>`
    IntList(Vec<i64>),
    /// Unboxed backing array for `List<Float>`
    FloatList(Vec<f64>),
    /// Unboxed backing array for `List<Bool>`
    BoolList(Vec<bool>),
    /// Unboxed backing array for `List<String>`
    StringList(Vec<String>),
    /// Boxed list for composite element types
    List(Vec<RawValue>),
    Map(Vec<(RawValue, RawValue)>),
    Optional(Option<Box<RawValue>>),
    /// Product as ordered field slots; names live in the declared type
    Product(Vec<RawValue>),
}

impl RawValue {
    /// Short tag for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RawValue::Unit => "unit",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(_) => "float",
            RawValue::String(_) => "string",
            RawValue::IntList(_) => "int list",
            RawValue::FloatList(_) => "float list",
            RawValue::BoolList(_) => "bool list",
            RawValue::StringList(_) => "string list",
            RawValue::List(_) => "list",
            RawValue::Map(_) => "map",
            RawValue::Optional(_) => "option",
            RawValue::Product(_) => "product",
        }
    }

    /// Truthiness for inline-transform boolean logic.
    ///
    /// Only `Bool` values are truthy-typed; anything else is a transform
    /// evaluation error handled by the caller.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Element count for lists in any layout.
    pub fn list_len(&self) -> Option<usize> {
        match self {
            RawValue::IntList(xs) => Some(xs.len()),
            RawValue::FloatList(xs) => Some(xs.len()),
            RawValue::BoolList(xs) => Some(xs.len()),
            RawValue::StringList(xs) => Some(xs.len()),
            RawValue::List(xs) => Some(xs.len()),
            _ => None,
        }
    }

    /// Shallow structural check against a declared type.
    ///
    /// Cheap (does not recurse into collections); used by the engine's
    /// debug mode at module boundaries. Full checks go through
    /// [`CValue::from_raw`].
    pub fn conforms_shallow(&self, ctype: &CType) -> bool {
        match (ctype, self) {
            (CType::Unit, RawValue::Unit)
            | (CType::Bool, RawValue::Bool(_))
            | (CType::Int, RawValue::Int(_))
            | (CType::Float, RawValue::Float(_))
            | (CType::String, RawValue::String(_))
            | (CType::Map(_, _), RawValue::Map(_))
            | (CType::Option(_), RawValue::Optional(_)) => true,
            (CType::List(elem), raw) => match (elem.as_ref(), raw) {
                (CType::Int, RawValue::IntList(_))
                | (CType::Float, RawValue::FloatList(_))
                | (CType::Bool, RawValue::BoolList(_))
                | (CType::String, RawValue::StringList(_)) => true,
                (_, RawValue::List(_)) => !elem.has_unboxed_list(),
                _ => false,
            },
            (CType::Product(fields), RawValue::Product(slots)) => fields.len() == slots.len(),
            _ => false,
        }
    }
}

/// Errors raised by value conversions.
#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    /// Declared type disagrees with a supplied value
    #[error("Type mismatch in {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: String,
        actual: String,
        context: String,
    },

    /// A conversion limit was exceeded
    #[error("Resource limit exceeded: {what} is {actual}, limit {limit}")]
    ResourceExhausted {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    /// Malformed canonical type signature
    #[error("Invalid type signature {input:?} at byte {position}: expected {expected}")]
    SignatureParse {
        input: String,
        position: usize,
        expected: String,
    },

    /// Underlying JSON parse failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
