use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RequestId;

/// Header mapping as it appears on the wire: insertion-ordered, each value a
/// string or a list of strings for repeated header names.
pub type Headers = serde_json::Map<String, Value>;

/// One control-channel frame, either direction.
///
/// `registered`, `error` and `request` flow relay -> client; `response`
/// flows client -> relay. A frame that does not match any known shape fails
/// to decode and is dropped by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Registered {
        subdomain: String,
        url: String,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: RequestId,
        method: String,
        path: String,
        headers: Headers,
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: RequestId,
        status: u16,
        headers: Headers,
        body: String,
    },
}

impl WireMessage {
    /// Decode one text frame. Malformed frames (bad JSON, unknown tag,
    /// missing fields) yield `None` and never surface to callers.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn response(response: &ForwardedResponse) -> Self {
        WireMessage::Response {
            request_id: response.request_id.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: encode_body(&response.body),
        }
    }
}

/// An inbound request as delivered by the relay, body already decoded to
/// raw bytes.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub request_id: RequestId,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ForwardedRequest {
    /// Build from the fields of a decoded `request` frame. Returns `None`
    /// when the body is not valid base64, which is treated the same as any
    /// other malformed frame.
    pub fn from_frame(
        request_id: RequestId,
        method: String,
        path: String,
        headers: Headers,
        body: &str,
    ) -> Option<Self> {
        let body = decode_body(body)?;
        Some(Self {
            request_id,
            method,
            path,
            headers,
            body,
        })
    }
}

/// The reply for one [`ForwardedRequest`], carrying the same id.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub request_id: RequestId,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

pub fn encode_body(body: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, body)
}

pub fn decode_body(body: &str) -> Option<Vec<u8>> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, body).ok()
}
