//! Decoding and validation of "document uploaded" payloads.

use serde_json::Value;
use validator::Validate;

use docflow_core::models::ProcessDocumentRequest;
use docflow_core::PoisonKind;

/// Other services publish the id as `documentId`; `document_id` wins when
/// both are present.
fn normalize(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        let has_id = map.get("document_id").is_some_and(|v| !v.is_null());
        if !has_id {
            if let Some(alias) = map.get("documentId").cloned() {
                map.insert("document_id".to_string(), alias);
            }
        }
    }
    value
}

/// Parse a raw message value into a validated request.
///
/// The error tells which stage rejected the payload and why.
pub fn parse_request(raw: &[u8]) -> Result<ProcessDocumentRequest, (PoisonKind, String)> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| (PoisonKind::Parse, e.to_string()))?;

    let request: ProcessDocumentRequest = serde_json::from_value(normalize(value))
        .map_err(|e| (PoisonKind::Schema, e.to_string()))?;

    request
        .validate()
        .map_err(|e| (PoisonKind::Schema, e.to_string()))?;

    Ok(request)
}
