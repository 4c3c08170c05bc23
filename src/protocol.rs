//! Protocol Module
//!
//! JSON envelopes exchanged with devices and factory tooling. Signed serial
//! assertions travel in the assertion wire encoding instead; everything
//! else, including every error, is one of these bodies.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Content type of every JSON body
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Error envelope returned for any rejected request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Answer to `/v1/nonce` and `/v1/request-id`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NonceResponse {
    pub success: bool,
    #[serde(rename = "request-id")]
    pub request_id: String,
}

impl NonceResponse {
    pub fn new(request_id: String) -> Self {
        Self {
            success: true,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VersionResponse {
    pub version: String,
}

/// Serialize an envelope to JSON bytes
///
/// # Example
/// ```no_run
/// use serial_vault::protocol::{serialize_response, NonceResponse};
///
/// let bytes = serialize_response(&NonceResponse::new("abc".to_string()))?;
/// assert_eq!(bytes, br#"{"success":true,"request-id":"abc"}"#);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn serialize_response<T: Serialize>(response: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(response).context("Failed to serialize response to JSON")
}

/// Deserialize JSON bytes into an envelope
pub fn deserialize_response<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let json_str =
        std::str::from_utf8(bytes).context("Failed to decode response bytes as UTF-8")?;

    let response: T =
        serde_json::from_str(json_str).context("Failed to deserialize JSON to response")?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_response_field_name() {
        let bytes = serialize_response(&NonceResponse::new("abc".to_string())).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["request-id"], "abc");
    }

    #[test]
    fn test_deserialize_error_response() {
        let json = r#"{"success":false,"code":"invalid-nonce","message":"nonce is invalid or expired"}"#;
        let response: ErrorResponse = deserialize_response(json.as_bytes()).unwrap();
        assert!(!response.success);
        assert_eq!(response.code, "invalid-nonce");
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(deserialize_response::<ErrorResponse>(b"\xff\xfe").is_err());
        assert!(deserialize_response::<VersionResponse>(b"{}").is_err());
    }
}
