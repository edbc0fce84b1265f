//! Suspension Codec
//!
//! Serializes suspension snapshots to a self-describing JSON wire format.
//! Every embedded value is written as a `{"type": ..., "value": ...}` pair
//! with the type rendered as its canonical signature string, so decoding
//! needs no external type information.

use super::SuspendedExecution;
use crate::dag::{DagSpec, ModuleCallOptions};
use crate::value::{cvalue_to_json, json_to_cvalue, CType, CValue, ValueError};
use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;
use uuid::Uuid;

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("Snapshot is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Snapshot field '{field}' is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Pluggable snapshot serialization.
///
/// Implementations must preserve `CValue`/`CType` fidelity and the module
/// status set; anything less makes resumed executions diverge.
pub trait SuspensionCodec: Send + Sync {
    fn encode(&self, snapshot: &SuspendedExecution) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<SuspendedExecution, CodecError>;
}

/// The default self-describing JSON codec.
pub struct JsonSuspensionCodec;

/// Encode one typed value as its `{type, value}` pair.
pub fn encode_tagged(value: &CValue) -> Json {
    json!({
        "type": value.ctype().signature(),
        "value": cvalue_to_json(value),
    })
}

/// Decode a `{type, value}` pair back into a typed value.
pub fn decode_tagged(json: &Json) -> Result<CValue, CodecError> {
    let obj = json.as_object().ok_or(CodecError::Malformed {
        field: "value",
        reason: "expected a {type, value} object".to_string(),
    })?;
    let sig = obj
        .get("type")
        .and_then(Json::as_str)
        .ok_or(CodecError::MissingField("type"))?;
    let payload = obj.get("value").ok_or(CodecError::MissingField("value"))?;
    let ctype = CType::parse_signature(sig)?;
    Ok(json_to_cvalue(payload, &ctype)?)
}

impl SuspensionCodec for JsonSuspensionCodec {
    fn encode(&self, snapshot: &SuspendedExecution) -> Result<Vec<u8>, CodecError> {
        let mut provided = Map::new();
        for (name, value) in &snapshot.provided_inputs {
            provided.insert(name.clone(), encode_tagged(value));
        }
        let mut computed = Map::new();
        for (id, value) in &snapshot.computed_values {
            computed.insert(id.to_string(), encode_tagged(value));
        }
        let mut statuses = Map::new();
        for (id, status) in &snapshot.module_statuses {
            statuses.insert(id.to_string(), Json::String(status.clone()));
        }
        let mut options = Map::new();
        for (id, opts) in &snapshot.module_options {
            options.insert(id.to_string(), serde_json::to_value(opts)?);
        }
        let doc = json!({
            "executionId": snapshot.execution_id,
            "structuralHash": snapshot.structural_hash,
            "resumptionCount": snapshot.resumption_count,
            "dagSpec": serde_json::to_value(&snapshot.dag_spec)?,
            "moduleOptions": Json::Object(options),
            "providedInputs": Json::Object(provided),
            "computedValues": Json::Object(computed),
            "moduleStatuses": Json::Object(statuses),
        });
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SuspendedExecution, CodecError> {
        let doc: Json = serde_json::from_slice(bytes)?;
        let obj = doc.as_object().ok_or(CodecError::Malformed {
            field: "root",
            reason: "expected an object".to_string(),
        })?;

        let execution_id = obj
            .get("executionId")
            .and_then(Json::as_str)
            .ok_or(CodecError::MissingField("executionId"))?
            .to_string();
        let structural_hash = obj
            .get("structuralHash")
            .and_then(Json::as_str)
            .ok_or(CodecError::MissingField("structuralHash"))?
            .to_string();
        let resumption_count = obj
            .get("resumptionCount")
            .and_then(Json::as_u64)
            .ok_or(CodecError::MissingField("resumptionCount"))?
            as u32;
        let dag_spec: DagSpec = serde_json::from_value(
            obj.get("dagSpec")
                .cloned()
                .ok_or(CodecError::MissingField("dagSpec"))?,
        )?;

        let mut module_options: HashMap<Uuid, ModuleCallOptions> = HashMap::new();
        if let Some(options) = obj.get("moduleOptions").and_then(Json::as_object) {
            for (key, value) in options {
                let id = parse_uuid("moduleOptions", key)?;
                module_options.insert(id, serde_json::from_value(value.clone())?);
            }
        }

        let mut provided_inputs = HashMap::new();
        if let Some(provided) = obj.get("providedInputs").and_then(Json::as_object) {
            for (name, value) in provided {
                provided_inputs.insert(name.clone(), decode_tagged(value)?);
            }
        }

        let mut computed_values = HashMap::new();
        if let Some(computed) = obj.get("computedValues").and_then(Json::as_object) {
            for (key, value) in computed {
                let id = parse_uuid("computedValues", key)?;
                computed_values.insert(id, decode_tagged(value)?);
            }
        }

        let mut module_statuses = HashMap::new();
        if let Some(statuses) = obj.get("moduleStatuses").and_then(Json::as_object) {
            for (key, value) in statuses {
                let id = parse_uuid("moduleStatuses", key)?;
                let tag = value.as_str().ok_or(CodecError::Malformed {
                    field: "moduleStatuses",
                    reason: format!("status for {key} is not a string"),
                })?;
                module_statuses.insert(id, tag.to_string());
            }
        }

        Ok(SuspendedExecution {
            execution_id,
            structural_hash,
            resumption_count,
            dag_spec,
            module_options,
            provided_inputs,
            computed_values,
            module_statuses,
        })
    }
}

fn parse_uuid(field: &'static str, key: &str) -> Result<Uuid, CodecError> {
    key.parse().map_err(|_| CodecError::Malformed {
        field,
        reason: format!("'{key}' is not a UUID"),
    })
}
