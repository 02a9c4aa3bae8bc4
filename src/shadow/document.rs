//! Shadow update documents on the wire.
//!
//! Outbound: `{"state":{"reported": <state>}}`.
//! Inbound: `{"state":{"desired": <state>, ...}}`; sibling keys such as
//! `delta`, `previous` or `metadata` are ignored.

use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct ReportedDocument<'a> {
    state: ReportedSection<'a>,
}

#[derive(Serialize)]
struct ReportedSection<'a> {
    reported: &'a State,
}

#[derive(Deserialize)]
struct InboundDocument {
    state: InboundSection,
}

#[derive(Deserialize)]
struct InboundSection {
    #[serde(default)]
    desired: Option<Value>,
}

/// Why an inbound shadow document was unusable.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("invalid shadow document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("\"state.desired\" must be an object, got {0}")]
    DesiredNotObject(&'static str),
}

/// Body of a `get/rejected` or `update/rejected` message.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct RejectedDocument<'a> {
    pub code: u16,
    #[serde(borrow)]
    pub message: &'a str,
}

/// Encodes a "reported" update for `state`.
pub fn encode_reported(state: &State) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ReportedDocument {
        state: ReportedSection { reported: state },
    })
}

/// Extracts the "desired" state from an inbound document.
///
/// `Ok(None)` means the document is well formed but carries no desired state.
pub fn decode_desired(payload: &[u8]) -> Result<Option<State>, DocumentError> {
    let document: InboundDocument = serde_json::from_slice(payload)?;
    match document.state.desired {
        None => Ok(None),
        Some(Value::Object(desired)) => Ok(Some(desired)),
        Some(other) => Err(DocumentError::DesiredNotObject(kind(&other))),
    }
}

/// Decodes a rejection without allocating.
pub fn decode_rejected(payload: &[u8]) -> Result<RejectedDocument<'_>, serde_json_core::de::Error> {
    serde_json_core::from_slice(payload).map(|(document, _)| document)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
