//! Request and response envelopes.
//!
//! A request body is a JSON object with two fields:
//!
//! ```json
//! {"inputs": {"Image": "<base64>", ...}, "settings": {"Patch height": 256, ...}}
//! ```
//!
//! A response body is a flat JSON object mapping output names to base64
//! content. The correlation id and reply target never appear in either
//! body; they travel as broker message properties ([`MessageProperties`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::CodecError;
use crate::types::{CorrelationId, NamedBlobs, Settings, REPLY_QUEUE};

/// Broker-level metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<CorrelationId>,
    /// Queue the response must be published to.
    pub reply_to: Option<String>,
}

/// A fully assembled message ready to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A decoded job request, as seen by the worker side.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub inputs: NamedBlobs,
    pub settings: Settings,
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    inputs: BTreeMap<String, String>,
    settings: Settings,
}

/// Build the request message for a job.
///
/// The reply target is always the shared [`REPLY_QUEUE`].
pub fn assemble_envelope(
    inputs: &NamedBlobs,
    settings: &Settings,
    correlation_id: &CorrelationId,
) -> OutboundMessage {
    let body = RequestBody {
        inputs: encode_all(inputs),
        settings: settings.clone(),
    };

    OutboundMessage {
        body: serde_json::to_vec(&body).expect("RequestBody is always serialisable"),
        properties: MessageProperties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(REPLY_QUEUE.to_string()),
        },
    }
}

/// Parse a response body and decode the expected outputs.
///
/// Every name in `expected` must be present as a string field holding
/// valid base64. Extra fields are ignored. When `expected` is empty, every
/// field of the body is decoded.
pub fn parse_envelope(body: &[u8], expected: &[&str]) -> Result<NamedBlobs, CodecError> {
    let fields: BTreeMap<String, serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| CodecError::MalformedPayload(format!("response is not a JSON object: {e}")))?;

    if expected.is_empty() {
        return fields
            .iter()
            .map(|(name, value)| decode_field(name, Some(value)).map(|bytes| (name.clone(), bytes)))
            .collect();
    }

    expected
        .iter()
        .map(|name| decode_field(name, fields.get(*name)).map(|bytes| (name.to_string(), bytes)))
        .collect()
}

/// Parse a request body on the worker side.
pub fn parse_request(body: &[u8]) -> Result<JobRequest, CodecError> {
    let raw: RequestBody = serde_json::from_slice(body)
        .map_err(|e| CodecError::MalformedPayload(format!("invalid request body: {e}")))?;

    let inputs = raw
        .inputs
        .iter()
        .map(|(name, text)| {
            codec::decode(text)
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| CodecError::MalformedPayload(format!("input '{name}': {e}")))
        })
        .collect::<Result<NamedBlobs, CodecError>>()?;

    Ok(JobRequest {
        inputs,
        settings: raw.settings,
    })
}

/// Build a response body from named outputs.
pub fn assemble_response(outputs: &NamedBlobs) -> Vec<u8> {
    serde_json::to_vec(&encode_all(outputs)).expect("output map is always serialisable")
}

// ---- private helpers ----

fn encode_all(blobs: &NamedBlobs) -> BTreeMap<String, String> {
    blobs
        .iter()
        .map(|(name, bytes)| (name.clone(), codec::encode(bytes)))
        .collect()
}

fn decode_field(name: &str, value: Option<&serde_json::Value>) -> Result<Vec<u8>, CodecError> {
    let text = match value {
        Some(serde_json::Value::String(text)) => text,
        Some(_) => {
            return Err(CodecError::MalformedPayload(format!(
                "field '{name}' is not a string"
            )))
        }
        None => {
            return Err(CodecError::MalformedPayload(format!(
                "missing field '{name}'"
            )))
        }
    };

    codec::decode(text).map_err(|e| CodecError::MalformedPayload(format!("field '{name}': {e}")))
}
