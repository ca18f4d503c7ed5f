//! JSON-RPC style wire protocol.
//!
//! Every WebSocket text frame is one JSON object:
//! ```text
//! request       {"jsonrpc":"2.0","method":"createOfferRTCConnection","params":{},"id":3}
//! notification  {"jsonrpc":"2.0","method":"$patch","params":[...]}
//! success       {"jsonrpc":"2.0","result":{...},"id":3}
//! failure       {"jsonrpc":"2.0","error":{"message":"Method not found","code":-32601},"id":3}
//! ```
//!
//! Frames that are not JSON objects, or carry neither `method` nor `id`,
//! are dropped by the engine.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Error code for a method the callee does not know.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code for a handler that failed.
pub const HANDLER_FAILURE: i64 = 1;

/// Reserved method carrying state replication patches.
pub const STATE_PATCH_METHOD: &str = "$patch";

const VERSION: &str = "2.0";

/// Error object of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    pub code: i64,
}

impl RemoteError {
    pub fn method_not_found() -> Self {
        Self {
            message: "Method not found".to_string(),
            code: METHOD_NOT_FOUND,
        }
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: HANDLER_FAILURE,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        method: String,
        params: Value,
        id: Option<u64>,
    },
    Response {
        id: u64,
        outcome: Result<Value, RemoteError>,
    },
}

#[derive(Serialize, Deserialize, Default)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RemoteError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

/// Distinguishes `"result": null` (Some(Null)) from a missing field (None).
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Decode a frame; `None` for anything malformed.
pub fn decode(text: &str) -> Option<Envelope> {
    let raw: RawEnvelope = serde_json::from_str(text).ok()?;
    if let Some(method) = raw.method {
        return Some(Envelope::Request {
            method,
            params: raw.params.unwrap_or(Value::Null),
            id: raw.id,
        });
    }
    let id = raw.id?;
    let outcome = match raw.error {
        Some(error) => Err(error),
        None => Ok(raw.result.unwrap_or(Value::Null)),
    };
    Some(Envelope::Response { id, outcome })
}

/// Encode a request, or a notification when `id` is `None`.
pub fn encode_request(method: &str, params: Value, id: Option<u64>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RawEnvelope {
        jsonrpc: Some(VERSION.to_string()),
        method: Some(method.to_string()),
        params: Some(params),
        id,
        ..RawEnvelope::default()
    })
}

/// Encode a response to request `id`.
pub fn encode_response(id: u64, outcome: Result<Value, RemoteError>) -> Result<String, serde_json::Error> {
    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(error) => (None, Some(error)),
    };
    serde_json::to_string(&RawEnvelope {
        jsonrpc: Some(VERSION.to_string()),
        result,
        error,
        id: Some(id),
        ..RawEnvelope::default()
    })
}

/// Methods the relay invokes on emitters and receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCall {
    CreateRtcConnection,
    DeleteRtcConnection,
    CreateOfferRtcConnection,
    CreateAnswerRtcConnection,
    CompleteOfferRtcConnection,
    IceCandidate,
    UploadFile,
    RemoveFile,
    ChangeStreamConfig,
}

impl PeerCall {
    pub const ALL: [PeerCall; 9] = [
        PeerCall::CreateRtcConnection,
        PeerCall::DeleteRtcConnection,
        PeerCall::CreateOfferRtcConnection,
        PeerCall::CreateAnswerRtcConnection,
        PeerCall::CompleteOfferRtcConnection,
        PeerCall::IceCandidate,
        PeerCall::UploadFile,
        PeerCall::RemoveFile,
        PeerCall::ChangeStreamConfig,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            PeerCall::CreateRtcConnection => "createRTCConnection",
            PeerCall::DeleteRtcConnection => "deleteRTCConnection",
            PeerCall::CreateOfferRtcConnection => "createOfferRTCConnection",
            PeerCall::CreateAnswerRtcConnection => "createAnswerRTCConnection",
            PeerCall::CompleteOfferRtcConnection => "completeOfferRTCConnection",
            PeerCall::IceCandidate => "iceCandidate",
            PeerCall::UploadFile => "uploadFile",
            PeerCall::RemoveFile => "removeFile",
            PeerCall::ChangeStreamConfig => "changeStreamConfig",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|call| call.name() == name)
    }
}
