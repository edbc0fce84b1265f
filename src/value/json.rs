//! JSON Conversion Module
//!
//! Typed conversion between JSON payloads and [`CValue`]s, guided by an
//! expected [`CType`].
//!
//! ## Design
//!
//! Three strategies, selected by payload size:
//!
//! - **Eager**: fully recursive materialization. Below the lazy threshold.
//! - **Lazy**: wraps the parsed JSON tree; each field or element converts
//!   on first access and is cached. Between the lazy and streaming
//!   thresholds.
//! - **Streaming**: a `DeserializeSeed` that builds the `CValue` directly
//!   off the JSON token stream with bounded depth, an array-element cap and
//!   a payload-size cap. Above the streaming threshold.
//!
//! Limit violations fail with [`ValueError::ResourceExhausted`]. All
//! strategies enforce the same limits; the thresholds only choose the
//! cheapest mechanism.

use super::{CType, CValue, ValueError};
use parking_lot::Mutex;
use serde::de::{DeserializeSeed, Error as DeError, MapAccess, SeqAccess, Visitor};
use serde_json::Value as Json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Limits applied to every JSON conversion.
#[derive(Debug, Clone)]
pub struct ConversionLimits {
    /// Maximum payload size in bytes
    pub max_payload_bytes: usize,

    /// Maximum number of elements in any single JSON array
    pub max_array_elements: usize,

    /// Maximum nesting depth
    pub max_nesting_depth: usize,

    /// Payloads at or below this size convert eagerly
    pub lazy_threshold_bytes: usize,

    /// Payloads above this size convert via the streaming path
    pub streaming_threshold_bytes: usize,
}

impl Default for ConversionLimits {
    fn default() -> Self {
        ConversionLimits {
            max_payload_bytes: 100 * 1024 * 1024,
            max_array_elements: 1_000_000,
            max_nesting_depth: 50,
            lazy_threshold_bytes: 10 * 1024,
            streaming_threshold_bytes: 100 * 1024,
        }
    }
}

impl ConversionLimits {
    /// Override the payload cap.
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Override the array-element cap.
    pub fn with_max_array_elements(mut self, elements: usize) -> Self {
        self.max_array_elements = elements;
        self
    }

    /// Override the nesting-depth cap.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }
}

/// Which conversion mechanism a payload takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStrategy {
    Eager,
    Lazy,
    Streaming,
}

impl ConversionStrategy {
    /// Select a strategy for a payload of `len` bytes.
    pub fn for_payload(len: usize, limits: &ConversionLimits) -> Self {
        if len <= limits.lazy_threshold_bytes {
            ConversionStrategy::Eager
        } else if len <= limits.streaming_threshold_bytes {
            ConversionStrategy::Lazy
        } else {
            ConversionStrategy::Streaming
        }
    }
}

/// Convert a parsed JSON tree into a typed value, using default limits.
pub fn json_to_cvalue(json: &Json, expected: &CType) -> Result<CValue, ValueError> {
    convert_eager(json, expected, 0, &ConversionLimits::default())
}

/// Render a typed value as JSON.
///
/// - `Unit` and absent options render as `null`.
/// - Maps with `String` keys render as objects; other key types render as
///   an array of `[key, value]` pairs.
/// - Non-finite floats render as `null` (JSON has no encoding for them).
pub fn cvalue_to_json(value: &CValue) -> Json {
    match value {
        CValue::Unit => Json::Null,
        CValue::Bool(b) => Json::Bool(*b),
        CValue::Int(i) => Json::Number((*i).into()),
        CValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        CValue::String(s) => Json::String(s.clone()),
        CValue::List { items, .. } => Json::Array(items.iter().map(cvalue_to_json).collect()),
        CValue::Map { key, entries, .. } => {
            if *key == CType::String {
                let mut obj = serde_json::Map::new();
                for (k, v) in entries {
                    let name = match k {
                        CValue::String(s) => s.clone(),
                        other => cvalue_to_json(other).to_string(),
                    };
                    obj.insert(name, cvalue_to_json(v));
                }
                Json::Object(obj)
            } else {
                Json::Array(
                    entries
                        .iter()
                        .map(|(k, v)| Json::Array(vec![cvalue_to_json(k), cvalue_to_json(v)]))
                        .collect(),
                )
            }
        }
        CValue::Optional { value, .. } => match value {
            Some(v) => cvalue_to_json(v),
            None => Json::Null,
        },
        CValue::Product { fields } => {
            let mut obj = serde_json::Map::new();
            for (name, v) in fields {
                obj.insert(name.clone(), cvalue_to_json(v));
            }
            Json::Object(obj)
        }
    }
}

/// Parse a JSON payload into a typed value, choosing the strategy by size.
///
/// The payload-size cap applies before any parsing; a payload of exactly
/// `max_payload_bytes` succeeds, one byte more fails.
pub fn parse_json_str(
    text: &str,
    expected: &CType,
    limits: &ConversionLimits,
) -> Result<CValue, ValueError> {
    if text.len() > limits.max_payload_bytes {
        return Err(ValueError::ResourceExhausted {
            what: "payload bytes",
            limit: limits.max_payload_bytes,
            actual: text.len(),
        });
    }
    match ConversionStrategy::for_payload(text.len(), limits) {
        ConversionStrategy::Eager => {
            let json: Json = serde_json::from_str(text)?;
            convert_eager(&json, expected, 0, limits)
        }
        ConversionStrategy::Lazy => {
            let json: Json = serde_json::from_str(text)?;
            LazyJsonValue::new(Arc::new(json), expected.clone(), limits.clone()).force()
        }
        ConversionStrategy::Streaming => convert_streaming(text, expected, limits),
    }
}

// ---------------------------------------------------------------------------
// Eager path
// ---------------------------------------------------------------------------

fn convert_eager(
    json: &Json,
    expected: &CType,
    depth: usize,
    limits: &ConversionLimits,
) -> Result<CValue, ValueError> {
    if depth > limits.max_nesting_depth {
        return Err(ValueError::ResourceExhausted {
            what: "nesting depth",
            limit: limits.max_nesting_depth,
            actual: depth,
        });
    }
    match (expected, json) {
        (CType::Unit, Json::Null) => Ok(CValue::Unit),
        (CType::Bool, Json::Bool(b)) => Ok(CValue::Bool(*b)),
        (CType::Int, Json::Number(n)) => number_to_int(n).map(CValue::Int).ok_or_else(|| {
            mismatch(expected, json, "integer conversion")
        }),
        (CType::Float, Json::Number(n)) => n
            .as_f64()
            .map(CValue::Float)
            .ok_or_else(|| mismatch(expected, json, "float conversion")),
        (CType::String, Json::String(s)) => Ok(CValue::String(s.clone())),
        (CType::List(elem), Json::Array(items)) => {
            if items.len() > limits.max_array_elements {
                return Err(ValueError::ResourceExhausted {
                    what: "array elements",
                    limit: limits.max_array_elements,
                    actual: items.len(),
                });
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(convert_eager(item, elem, depth + 1, limits)?);
            }
            Ok(CValue::List {
                elem: (**elem).clone(),
                items: out,
            })
        }
        (CType::Map(key, value), json) => convert_map(json, key, value, depth, limits),
        (CType::Option(inner), Json::Null) => Ok(CValue::none((**inner).clone())),
        (CType::Option(inner), present) => Ok(CValue::some(
            (**inner).clone(),
            convert_eager(present, inner, depth + 1, limits)?,
        )),
        (CType::Product(fields), Json::Object(obj)) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, field_ty) in fields {
                let field_json = obj
                    .get(name)
                    .ok_or_else(|| mismatch(expected, json, &format!("missing field '{name}'")))?;
                out.push((
                    name.clone(),
                    convert_eager(field_json, field_ty, depth + 1, limits)?,
                ));
            }
            Ok(CValue::Product { fields: out })
        }
        _ => Err(mismatch(expected, json, "json conversion")),
    }
}

fn convert_map(
    json: &Json,
    key: &CType,
    value: &CType,
    depth: usize,
    limits: &ConversionLimits,
) -> Result<CValue, ValueError> {
    let entries = match (key, json) {
        // String-keyed maps arrive as objects.
        (CType::String, Json::Object(obj)) => {
            let mut entries = Vec::with_capacity(obj.len());
            for (k, v) in obj {
                entries.push((
                    CValue::String(k.clone()),
                    convert_eager(v, value, depth + 1, limits)?,
                ));
            }
            entries
        }
        // Any other key type arrives as an array of [key, value] pairs.
        (_, Json::Array(pairs)) => {
            if pairs.len() > limits.max_array_elements {
                return Err(ValueError::ResourceExhausted {
                    what: "array elements",
                    limit: limits.max_array_elements,
                    actual: pairs.len(),
                });
            }
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let Json::Array(kv) = pair else {
                    return Err(mismatch(
                        &CType::Map(Box::new(key.clone()), Box::new(value.clone())),
                        json,
                        "map entry must be a [key, value] pair",
                    ));
                };
                if kv.len() != 2 {
                    return Err(mismatch(
                        &CType::Map(Box::new(key.clone()), Box::new(value.clone())),
                        json,
                        "map entry must be a [key, value] pair",
                    ));
                }
                entries.push((
                    convert_eager(&kv[0], key, depth + 1, limits)?,
                    convert_eager(&kv[1], value, depth + 1, limits)?,
                ));
            }
            entries
        }
        _ => {
            return Err(mismatch(
                &CType::Map(Box::new(key.clone()), Box::new(value.clone())),
                json,
                "json conversion",
            ))
        }
    };
    Ok(CValue::Map {
        key: key.clone(),
        value: value.clone(),
        entries,
    })
}

fn number_to_int(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    // Accept floats with no fractional part (number normalization).
    n.as_f64().and_then(|f| {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            Some(f as i64)
        } else {
            None
        }
    })
}

fn mismatch(expected: &CType, json: &Json, context: &str) -> ValueError {
    ValueError::TypeMismatch {
        expected: expected.signature(),
        actual: json_kind(json).to_string(),
        context: context.to_string(),
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Lazy path
// ---------------------------------------------------------------------------

/// Lazily converted JSON value.
///
/// Holds the parsed JSON tree and converts subtrees on first access,
/// caching each converted field or element. Mid-sized payloads go through
/// this wrapper so that a module touching two fields of a large record does
/// not pay for the whole conversion.
pub struct LazyJsonValue {
    json: Arc<Json>,
    ctype: CType,
    limits: ConversionLimits,
    field_cache: Mutex<HashMap<String, CValue>>,
    index_cache: Mutex<HashMap<usize, CValue>>,
    forced: Mutex<Option<CValue>>,
}

impl LazyJsonValue {
    /// Wrap a parsed JSON tree with its expected type.
    pub fn new(json: Arc<Json>, ctype: CType, limits: ConversionLimits) -> Self {
        LazyJsonValue {
            json,
            ctype,
            limits,
            field_cache: Mutex::new(HashMap::new()),
            index_cache: Mutex::new(HashMap::new()),
            forced: Mutex::new(None),
        }
    }

    /// The declared type of the wrapped value.
    pub fn ctype(&self) -> &CType {
        &self.ctype
    }

    /// Convert a single product field, caching the result.
    pub fn field(&self, name: &str) -> Result<CValue, ValueError> {
        if let Some(hit) = self.field_cache.lock().get(name) {
            return Ok(hit.clone());
        }
        let field_ty = match &self.ctype {
            CType::Product(fields) => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.clone()),
            _ => None,
        }
        .ok_or_else(|| ValueError::TypeMismatch {
            expected: self.ctype.signature(),
            actual: format!("field access '{name}'"),
            context: "lazy field access".to_string(),
        })?;
        let field_json = self
            .json
            .get(name)
            .ok_or_else(|| mismatch(&self.ctype, &self.json, &format!("missing field '{name}'")))?;
        let converted = convert_eager(field_json, &field_ty, 1, &self.limits)?;
        self.field_cache
            .lock()
            .insert(name.to_string(), converted.clone());
        Ok(converted)
    }

    /// Convert a single list element, caching the result.
    pub fn index(&self, i: usize) -> Result<CValue, ValueError> {
        if let Some(hit) = self.index_cache.lock().get(&i) {
            return Ok(hit.clone());
        }
        let elem_ty = match &self.ctype {
            CType::List(elem) => (**elem).clone(),
            _ => {
                return Err(ValueError::TypeMismatch {
                    expected: self.ctype.signature(),
                    actual: format!("index access [{i}]"),
                    context: "lazy index access".to_string(),
                })
            }
        };
        let elem_json = self
            .json
            .get(i)
            .ok_or_else(|| mismatch(&self.ctype, &self.json, &format!("missing index [{i}]")))?;
        let converted = convert_eager(elem_json, &elem_ty, 1, &self.limits)?;
        self.index_cache.lock().insert(i, converted.clone());
        Ok(converted)
    }

    /// Fully materialize the wrapped value, caching the result.
    pub fn force(&self) -> Result<CValue, ValueError> {
        if let Some(hit) = self.forced.lock().as_ref() {
            return Ok(hit.clone());
        }
        let converted = convert_eager(&self.json, &self.ctype, 0, &self.limits)?;
        *self.forced.lock() = Some(converted.clone());
        Ok(converted)
    }
}

impl fmt::Debug for LazyJsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyJsonValue")
            .field("ctype", &self.ctype.signature())
            .field("forced", &self.forced.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Streaming path
// ---------------------------------------------------------------------------

/// Convert a large payload without materializing an intermediate JSON tree.
///
/// A `DeserializeSeed` drives serde_json's token stream and builds the
/// `CValue` directly, checking the depth and array caps as tokens arrive.
fn convert_streaming(
    text: &str,
    expected: &CType,
    limits: &ConversionLimits,
) -> Result<CValue, ValueError> {
    let violation: RefCell<Option<ValueError>> = RefCell::new(None);
    let mut de = serde_json::Deserializer::from_str(text);
    let seed = TypedSeed {
        ctype: expected,
        limits,
        depth: 0,
        violation: &violation,
    };
    match seed.deserialize(&mut de) {
        Ok(value) => {
            de.end()?;
            Ok(value)
        }
        Err(json_err) => {
            // A limit or type violation recorded mid-stream takes priority
            // over the serde error it was smuggled through.
            match violation.into_inner() {
                Some(v) => Err(v),
                None => Err(ValueError::Json(json_err)),
            }
        }
    }
}

struct TypedSeed<'a> {
    ctype: &'a CType,
    limits: &'a ConversionLimits,
    depth: usize,
    violation: &'a RefCell<Option<ValueError>>,
}

impl<'a> TypedSeed<'a> {
    fn child(&self, ctype: &'a CType) -> TypedSeed<'a> {
        TypedSeed {
            ctype,
            limits: self.limits,
            depth: self.depth + 1,
            violation: self.violation,
        }
    }

    fn record<E: DeError>(&self, err: ValueError) -> E {
        let msg = err.to_string();
        *self.violation.borrow_mut() = Some(err);
        E::custom(msg)
    }
}

impl<'de, 'a> DeserializeSeed<'de> for TypedSeed<'a> {
    type Value = CValue;

    fn deserialize<D>(self, deserializer: D) -> Result<CValue, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if self.depth > self.limits.max_nesting_depth {
            return Err(self.record(ValueError::ResourceExhausted {
                what: "nesting depth",
                limit: self.limits.max_nesting_depth,
                actual: self.depth,
            }));
        }
        match self.ctype {
            CType::Unit => deserializer.deserialize_unit(UnitVisitor),
            CType::Bool => deserializer.deserialize_bool(BoolVisitor),
            CType::Int => deserializer.deserialize_i64(IntVisitor),
            CType::Float => deserializer.deserialize_f64(FloatVisitor),
            CType::String => deserializer.deserialize_string(StringVisitor),
            CType::List(elem) => deserializer.deserialize_seq(ListVisitor {
                elem,
                seed: &self,
            }),
            CType::Map(key, value) => {
                if **key == CType::String {
                    deserializer.deserialize_map(StringMapVisitor {
                        key,
                        value,
                        seed: &self,
                    })
                } else {
                    deserializer.deserialize_seq(PairMapVisitor {
                        key,
                        value,
                        seed: &self,
                    })
                }
            }
            CType::Option(inner) => deserializer.deserialize_option(OptionVisitor {
                inner,
                seed: &self,
            }),
            CType::Product(fields) => deserializer.deserialize_map(ProductVisitor {
                fields,
                seed: &self,
            }),
        }
    }
}

struct UnitVisitor;

impl<'de> Visitor<'de> for UnitVisitor {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null")
    }

    fn visit_unit<E: DeError>(self) -> Result<CValue, E> {
        Ok(CValue::Unit)
    }
}

struct BoolVisitor;

impl<'de> Visitor<'de> for BoolVisitor {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a boolean")
    }

    fn visit_bool<E: DeError>(self, v: bool) -> Result<CValue, E> {
        Ok(CValue::Bool(v))
    }
}

struct IntVisitor;

impl<'de> Visitor<'de> for IntVisitor {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 64-bit signed integer")
    }

    fn visit_i64<E: DeError>(self, v: i64) -> Result<CValue, E> {
        Ok(CValue::Int(v))
    }

    fn visit_u64<E: DeError>(self, v: u64) -> Result<CValue, E> {
        i64::try_from(v)
            .map(CValue::Int)
            .map_err(|_| E::custom("integer out of i64 range"))
    }

    fn visit_f64<E: DeError>(self, v: f64) -> Result<CValue, E> {
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Ok(CValue::Int(v as i64))
        } else {
            Err(E::custom("number has a fractional part"))
        }
    }
}

struct FloatVisitor;

impl<'de> Visitor<'de> for FloatVisitor {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a floating-point number")
    }

    fn visit_i64<E: DeError>(self, v: i64) -> Result<CValue, E> {
        Ok(CValue::Float(v as f64))
    }

    fn visit_u64<E: DeError>(self, v: u64) -> Result<CValue, E> {
        Ok(CValue::Float(v as f64))
    }

    fn visit_f64<E: DeError>(self, v: f64) -> Result<CValue, E> {
        Ok(CValue::Float(v))
    }
}

struct StringVisitor;

impl<'de> Visitor<'de> for StringVisitor {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string")
    }

    fn visit_str<E: DeError>(self, v: &str) -> Result<CValue, E> {
        Ok(CValue::String(v.to_string()))
    }

    fn visit_string<E: DeError>(self, v: String) -> Result<CValue, E> {
        Ok(CValue::String(v))
    }
}

struct ListVisitor<'a, 'b> {
    elem: &'a CType,
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> Visitor<'de> for ListVisitor<'a, 'b> {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<CValue, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = access.next_element_seed(self.seed.child(self.elem))? {
            items.push(item);
            if items.len() > self.seed.limits.max_array_elements {
                return Err(self.seed.record(ValueError::ResourceExhausted {
                    what: "array elements",
                    limit: self.seed.limits.max_array_elements,
                    actual: items.len(),
                }));
            }
        }
        Ok(CValue::List {
            elem: self.elem.clone(),
            items,
        })
    }
}

struct StringMapVisitor<'a, 'b> {
    key: &'a CType,
    value: &'a CType,
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> Visitor<'de> for StringMapVisitor<'a, 'b> {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<CValue, A::Error> {
        let mut entries = Vec::new();
        while let Some(name) = access.next_key::<String>()? {
            let v = access.next_value_seed(self.seed.child(self.value))?;
            entries.push((CValue::String(name), v));
            if entries.len() > self.seed.limits.max_array_elements {
                return Err(self.seed.record(ValueError::ResourceExhausted {
                    what: "array elements",
                    limit: self.seed.limits.max_array_elements,
                    actual: entries.len(),
                }));
            }
        }
        Ok(CValue::Map {
            key: self.key.clone(),
            value: self.value.clone(),
            entries,
        })
    }
}

struct PairMapVisitor<'a, 'b> {
    key: &'a CType,
    value: &'a CType,
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> Visitor<'de> for PairMapVisitor<'a, 'b> {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of [key, value] pairs")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<CValue, A::Error> {
        let mut entries = Vec::new();
        while let Some(pair) = access.next_element_seed(PairSeed {
            key: self.key,
            value: self.value,
            seed: self.seed,
        })? {
            entries.push(pair);
            if entries.len() > self.seed.limits.max_array_elements {
                return Err(self.seed.record(ValueError::ResourceExhausted {
                    what: "array elements",
                    limit: self.seed.limits.max_array_elements,
                    actual: entries.len(),
                }));
            }
        }
        Ok(CValue::Map {
            key: self.key.clone(),
            value: self.value.clone(),
            entries,
        })
    }
}

struct PairSeed<'a, 'b> {
    key: &'a CType,
    value: &'a CType,
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> DeserializeSeed<'de> for PairSeed<'a, 'b> {
    type Value = (CValue, CValue);

    fn deserialize<D>(self, deserializer: D) -> Result<(CValue, CValue), D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, 'a, 'b> Visitor<'de> for PairSeed<'a, 'b> {
    type Value = (CValue, CValue);

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a [key, value] pair")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<(CValue, CValue), A::Error> {
        let k = access
            .next_element_seed(self.seed.child(self.key))?
            .ok_or_else(|| A::Error::custom("map entry missing key"))?;
        let v = access
            .next_element_seed(self.seed.child(self.value))?
            .ok_or_else(|| A::Error::custom("map entry missing value"))?;
        if access.next_element_seed(self.seed.child(self.key))?.is_some() {
            return Err(A::Error::custom("map entry has more than two elements"));
        }
        Ok((k, v))
    }
}

struct OptionVisitor<'a, 'b> {
    inner: &'a CType,
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> Visitor<'de> for OptionVisitor<'a, 'b> {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a value or null")
    }

    fn visit_none<E: DeError>(self) -> Result<CValue, E> {
        Ok(CValue::none(self.inner.clone()))
    }

    fn visit_unit<E: DeError>(self) -> Result<CValue, E> {
        Ok(CValue::none(self.inner.clone()))
    }

    fn visit_some<D>(self, deserializer: D) -> Result<CValue, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = self.seed.child(self.inner).deserialize(deserializer)?;
        Ok(CValue::some(self.inner.clone(), inner))
    }
}

struct ProductVisitor<'a, 'b> {
    fields: &'a [(String, CType)],
    seed: &'b TypedSeed<'a>,
}

impl<'de, 'a, 'b> Visitor<'de> for ProductVisitor<'a, 'b> {
    type Value = CValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<CValue, A::Error> {
        let mut slots: Vec<Option<CValue>> = vec![None; self.fields.len()];
        while let Some(name) = access.next_key::<String>()? {
            let Some(idx) = self.fields.iter().position(|(n, _)| *n == name) else {
                return Err(self.seed.record(ValueError::TypeMismatch {
                    expected: CType::Product(self.fields.to_vec()).signature(),
                    actual: format!("unknown field '{name}'"),
                    context: "streaming product conversion".to_string(),
                }));
            };
            slots[idx] = Some(access.next_value_seed(self.seed.child(&self.fields[idx].1))?);
        }
        let mut fields = Vec::with_capacity(self.fields.len());
        for ((name, _), slot) in self.fields.iter().zip(slots) {
            let value = slot.ok_or_else(|| {
                self.seed.record(ValueError::TypeMismatch {
                    expected: CType::Product(self.fields.to_vec()).signature(),
                    actual: format!("missing field '{name}'"),
                    context: "streaming product conversion".to_string(),
                })
            })?;
            fields.push((name.clone(), value));
        }
        Ok(CValue::Product { fields })
    }
}
