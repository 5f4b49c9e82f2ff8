//! Payload normalization pipeline.
//!
//! Applies the registry rules to a raw payload in a fixed order: wallet
//! scoping, alias rewrites, sensitive denylist, unknown-field rejection,
//! required fields, value typing, server-owned stripping, datetime
//! canonicalization, JSON-field parsing, size cap, client-clock clamping.
//! The output is the canonical attribute bag that the version controller
//! persists verbatim.

use serde_json::{json, Map, Value};

use crate::protocol::cursor::{format_micros, parse_timestamp};
use crate::protocol::{ErrorCode, Operation};
use crate::validation::{clamp_client_ms, MAX_PAYLOAD_BYTES};

use super::{EntityDescriptor, SENSITIVE_FIELDS, STRIPPED_SYNC_FIELDS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeError {
    pub code: ErrorCode,
    pub detail: Option<Value>,
}

impl NormalizeError {
    fn new(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }

    fn with_detail(code: ErrorCode, detail: Value) -> Self {
        Self {
            code,
            detail: Some(detail),
        }
    }
}

/// Canonicalize `raw` for `entity_id` under `wallet_id`.
pub fn normalize_payload(
    desc: &EntityDescriptor,
    operation: Operation,
    entity_id: &str,
    raw: &Map<String, Value>,
    wallet_id: &str,
) -> Result<Map<String, Value>, NormalizeError> {
    if let Some(payload_wallet) = raw.get("wallet_id") {
        if !is_empty_value(payload_wallet) && payload_wallet.as_str() != Some(wallet_id) {
            return Err(NormalizeError::new(ErrorCode::WalletIdMismatch));
        }
    }

    let mut payload = raw.clone();
    payload.remove("id");

    apply_aliases(desc, &mut payload);
    reject_sensitive(&payload)?;
    reject_unknown(desc, &payload)?;
    if operation == Operation::Create {
        check_required(desc, &payload)?;
    }
    check_field_types(desc, &payload)?;

    for field in STRIPPED_SYNC_FIELDS {
        payload.remove(*field);
    }
    for field in desc.server_owned {
        payload.remove(*field);
    }

    normalize_datetimes(desc, &mut payload)?;
    parse_json_fields(desc, &mut payload)?;

    let encoded = serde_json::to_vec(&payload)
        .map_err(|_| NormalizeError::new(ErrorCode::PayloadMustBeObject))?;
    if encoded.len() > MAX_PAYLOAD_BYTES {
        return Err(NormalizeError::new(ErrorCode::PayloadTooLarge));
    }

    clamp_client_clocks(&mut payload)?;

    payload.insert("client_id".to_owned(), Value::String(entity_id.to_owned()));
    payload.insert("wallet_id".to_owned(), Value::String(wallet_id.to_owned()));

    Ok(payload)
}

fn apply_aliases(desc: &EntityDescriptor, payload: &mut Map<String, Value>) {
    for (wire, canonical) in desc.aliases {
        if payload.contains_key(*wire) && !payload.contains_key(*canonical) {
            if let Some(value) = payload.remove(*wire) {
                payload.insert((*canonical).to_owned(), value);
            }
        }
    }
}

fn reject_sensitive(payload: &Map<String, Value>) -> Result<(), NormalizeError> {
    let denied: Vec<&str> = payload
        .keys()
        .map(String::as_str)
        .filter(|key| SENSITIVE_FIELDS.contains(key))
        .collect();
    if denied.is_empty() {
        return Ok(());
    }
    Err(NormalizeError::with_detail(
        ErrorCode::SensitiveFieldNotAllowed,
        json!(denied),
    ))
}

fn reject_unknown(desc: &EntityDescriptor, payload: &Map<String, Value>) -> Result<(), NormalizeError> {
    let mut unknown: Vec<&str> = payload
        .keys()
        .map(String::as_str)
        .filter(|key| !desc.allows(key))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort_unstable();
    Err(NormalizeError::with_detail(
        ErrorCode::InvalidField,
        json!(unknown),
    ))
}

fn check_required(desc: &EntityDescriptor, payload: &Map<String, Value>) -> Result<(), NormalizeError> {
    let mut missing: Vec<&str> = desc
        .required
        .iter()
        .copied()
        .filter(|field| payload.get(*field).is_none_or(is_empty_value))
        .collect();

    for group in desc.required_any {
        let satisfied = group
            .iter()
            .any(|field| payload.get(*field).is_some_and(|v| !is_empty_value(v)));
        if !satisfied {
            missing.extend(group.iter().copied());
        }
    }

    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    missing.dedup();
    Err(NormalizeError::with_detail(
        ErrorCode::MissingRequiredFields,
        json!(missing),
    ))
}

fn check_field_types(desc: &EntityDescriptor, payload: &Map<String, Value>) -> Result<(), NormalizeError> {
    let mut invalid = Map::new();
    for (field, expected) in desc.field_types {
        let Some(value) = payload.get(*field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if !expected.matches(value) {
            invalid.insert((*field).to_owned(), Value::String(expected.name().to_owned()));
        }
    }
    if invalid.is_empty() {
        return Ok(());
    }
    Err(NormalizeError::with_detail(
        ErrorCode::InvalidFieldType,
        Value::Object(invalid),
    ))
}

fn normalize_datetimes(
    desc: &EntityDescriptor,
    payload: &mut Map<String, Value>,
) -> Result<(), NormalizeError> {
    for field in desc.datetime_fields {
        let Some(value) = payload.get(*field) else {
            continue;
        };
        if is_empty_value(value) {
            continue;
        }
        let raw = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(NormalizeError::with_detail(
                    ErrorCode::InvalidFieldType,
                    json!({ (*field): "datetime" }),
                ))
            }
        };
        let Some(micros) = parse_timestamp(&raw) else {
            return Err(NormalizeError::with_detail(
                ErrorCode::InvalidFieldType,
                json!({ (*field): "datetime" }),
            ));
        };
        payload.insert((*field).to_owned(), Value::String(format_micros(micros)));
    }
    Ok(())
}

fn parse_json_fields(
    desc: &EntityDescriptor,
    payload: &mut Map<String, Value>,
) -> Result<(), NormalizeError> {
    for field in desc.json_fields {
        let Some(value) = payload.get(*field) else {
            continue;
        };
        let Value::String(encoded) = value else {
            // Already structured JSON.
            continue;
        };
        if encoded.trim().is_empty() {
            continue;
        }
        let parsed: Value = serde_json::from_str(encoded).map_err(|_| {
            NormalizeError::with_detail(ErrorCode::InvalidFieldType, json!({ (*field): "json" }))
        })?;
        payload.insert((*field).to_owned(), parsed);
    }
    Ok(())
}

fn clamp_client_clocks(payload: &mut Map<String, Value>) -> Result<(), NormalizeError> {
    for field in ["client_created_ms", "client_modified_ms"] {
        let Some(value) = payload.get(field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let millis = match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        let Some(millis) = millis else {
            return Err(NormalizeError::with_detail(
                ErrorCode::InvalidFieldType,
                json!({ (field): "number" }),
            ));
        };
        payload.insert(field.to_owned(), json!(clamp_client_ms(millis)));
    }
    Ok(())
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
