//! Signing Pipeline
//!
//! Turns a device's serial-request into a serial assertion signed by the
//! model's signing key:
//!
//! 1. API-key check (existence only)
//! 2. Stream decode: a `serial-request`, optionally followed by a `model`
//! 3. Self-signature check of the serial-request against its device-key
//! 4. Nonce consumption (`request-id` header)
//! 5. Model lookup by `(brand, model, api-key)` and active-key check
//! 6. Serial number from the header, or from a `serial:` line in the body
//! 7. Duplicate check and revision assignment
//! 8. Signing through the keypair store
//! 9. Signing-log write; the assertion is only returned once it is logged
//!
//! Every failure maps onto one [`SigningError`] and one wire code.

use crate::assertion::{decode_stream, Assertion, AssertionType, Headers};
use crate::nonce::{NonceError, NonceManager};
use crate::private_key_storage::{KeypairStore, KeystoreError};
use crate::protocol::{serialize_response, ErrorResponse, JSON_CONTENT_TYPE};
use crate::signing_log::SigningLogService;
use crate::storage::{Datastore, DeviceNonce, NewSigningLog};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Invalid API key used")]
    InvalidApiKey,

    #[error("No data supplied for signing")]
    EmptyData,

    #[error("{0}")]
    DecodeAssertion(String),

    #[error("The assertion type must be 'serial-request'")]
    InvalidType,

    #[error("The 2nd assertion type must be 'model'")]
    InvalidSecondType,

    #[error("Model and serial-request assertion do not match")]
    MismatchedModel,

    #[error("unexpected assertion in the request stream")]
    UnexpectedAssertion,

    #[error("Nonce is invalid or expired")]
    InvalidNonce,

    #[error("Cannot find model with the matching brand and model")]
    InvalidModel,

    #[error("The model is linked with an inactive signing-key")]
    InactiveModel,

    #[error("The serial number is missing from both the header and body")]
    EmptySerial,

    #[error("Error converting the serial-request to a serial assertion: {0}")]
    CreateAssertion(String),

    #[error("Error signing the assertion")]
    SigningAssertion,

    #[error("Error logging the signed assertion")]
    LoggingAssertion,

    #[error("Error generating a nonce. Please try again later")]
    GenerateNonce,

    #[error("Internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl SigningError {
    /// Wire code of the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            SigningError::InvalidApiKey => "invalid-api-key",
            SigningError::EmptyData => "empty-data",
            SigningError::DecodeAssertion(_) | SigningError::UnexpectedAssertion => {
                "decode-assertion"
            }
            SigningError::InvalidType => "invalid-type",
            SigningError::InvalidSecondType => "invalid-second-type",
            SigningError::MismatchedModel => "mismatched-model",
            SigningError::InvalidNonce => "invalid-nonce",
            SigningError::InvalidModel => "invalid-model",
            SigningError::InactiveModel => "inactive-model",
            SigningError::EmptySerial => "empty-serial",
            SigningError::CreateAssertion(_) => "create-assertion",
            SigningError::SigningAssertion => "signing-assertion",
            SigningError::LoggingAssertion => "logging-assertion",
            SigningError::GenerateNonce => "generate-nonce",
            SigningError::Internal(_) => "internal-error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SigningError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Message sent to the client; internal causes stay in the logs
    pub fn message(&self) -> String {
        match self {
            SigningError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for SigningError {
    fn into_response(self) -> Response {
        let envelope = ErrorResponse::new(self.code(), self.message());
        match serialize_response(&envelope) {
            Ok(body) => (
                self.status(),
                [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => {
                error!("Failed to encode error response: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// The decoded request stream
struct SigningRequest {
    serial_request: Assertion,
    model: Option<Assertion>,
}

pub struct Signer {
    datastore: Arc<dyn Datastore>,
    keystore: Arc<KeypairStore>,
    nonces: NonceManager,
    signing_log: SigningLogService,
}

impl Signer {
    pub fn new(datastore: Arc<dyn Datastore>, keystore: Arc<KeypairStore>) -> Self {
        Self {
            nonces: NonceManager::new(datastore.clone()),
            signing_log: SigningLogService::new(datastore.clone()),
            datastore,
            keystore,
        }
    }

    pub fn keystore(&self) -> &KeypairStore {
        &self.keystore
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Issue a nonce to a device presenting a known API key
    pub async fn request_id(&self, api_key: &str) -> Result<DeviceNonce> {
        let result = async {
            self.check_api_key(api_key).await?;
            let issued = async {
                self.nonces.sweep_expired().await?;
                self.nonces.issue().await
            }
            .await;
            issued.map_err(|e| {
                error!("Failed to issue nonce: {}", e);
                SigningError::GenerateNonce
            })
        }
        .await;
        if let Err(e) = &result {
            warn!(code = e.code(), "Rejected request-id: {}", e);
        }
        result
    }

    /// Run the whole pipeline for one request body
    pub async fn sign_serial(&self, api_key: &str, data: &[u8]) -> Result<Assertion> {
        let result = self.run_pipeline(api_key, data).await;
        if let Err(e) = &result {
            warn!(code = e.code(), "Rejected serial request: {}", e);
        }
        result
    }

    async fn run_pipeline(&self, api_key: &str, data: &[u8]) -> Result<Assertion> {
        self.check_api_key(api_key).await?;

        let SigningRequest {
            serial_request,
            model,
        } = parse_assertion_stream(data)?;

        let device_key = serial_request.device_key().map_err(|e| {
            SigningError::DecodeAssertion(format!("invalid serial-request device-key: {}", e))
        })?;
        serial_request.verify(&device_key).map_err(|e| {
            SigningError::DecodeAssertion(format!(
                "could not validate serial-request self-signature ({})",
                e
            ))
        })?;

        let brand_id = serial_request.header("brand-id").unwrap_or_default();
        let model_name = serial_request.header("model").unwrap_or_default();
        if let Some(model) = &model {
            if model.header("brand-id") != Some(brand_id) || model.header("model") != Some(model_name)
            {
                return Err(SigningError::MismatchedModel);
            }
        }

        let request_id = serial_request.header("request-id").unwrap_or_default();
        self.nonces.consume(request_id).await.map_err(|e| {
            if let NonceError::Store(cause) = &e {
                error!("Failed to consume nonce: {:#}", cause);
            }
            SigningError::InvalidNonce
        })?;

        let model = self
            .datastore
            .find_model(brand_id, model_name, api_key)
            .await?
            .ok_or(SigningError::InvalidModel)?;
        if !model.signing_keypair.active {
            return Err(SigningError::InactiveModel);
        }

        let serial = serial_number(&serial_request).ok_or(SigningError::EmptySerial)?;
        let fingerprint = serial_request.sign_key_id();

        let revision = async {
            self.signing_log
                .check_existing(brand_id, model_name, &serial, fingerprint)
                .await?;
            self.signing_log
                .next_revision(brand_id, model_name, &serial)
                .await
        }
        .await
        .map_err(|e| SigningError::CreateAssertion(format!("{:#}", e)))?;

        let mut headers = Headers::new();
        headers.set("authority-id", brand_id);
        headers.set("brand-id", brand_id);
        headers.set("serial", serial.as_str());
        headers.set("device-key", serial_request.header("device-key").unwrap_or_default());
        headers.set("device-key-sha3-384", fingerprint);
        headers.set("model", model_name);
        headers.set(
            "timestamp",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        headers.set("revision", revision.to_string());

        let keypair = &model.signing_keypair;
        let signed = self
            .keystore
            .sign(
                AssertionType::Serial,
                headers,
                serial_request.body().to_vec(),
                &keypair.authority_id,
                &keypair.key_id,
                &keypair.sealed_key,
            )
            .await
            .map_err(|e| match e {
                KeystoreError::Assertion(e) => SigningError::CreateAssertion(e.to_string()),
                other => {
                    error!(key_id = keypair.key_id.as_str(), "Signing failed: {}", other);
                    SigningError::SigningAssertion
                }
            })?;

        self.signing_log
            .record(NewSigningLog {
                make: brand_id.to_string(),
                model: model_name.to_string(),
                serial_number: serial.clone(),
                fingerprint: fingerprint.to_string(),
                revision,
            })
            .await
            .map_err(|e| {
                error!("Signed assertion was not logged: {:#}", e);
                SigningError::LoggingAssertion
            })?;

        info!(
            brand_id,
            model = model_name,
            serial = serial.as_str(),
            revision,
            "Signed serial assertion"
        );
        Ok(signed)
    }

    async fn check_api_key(&self, api_key: &str) -> Result<()> {
        if api_key.is_empty() || !self.datastore.check_api_key(api_key).await? {
            return Err(SigningError::InvalidApiKey);
        }
        Ok(())
    }
}

fn parse_assertion_stream(data: &[u8]) -> Result<SigningRequest> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(SigningError::EmptyData);
    }
    let mut decoder = decode_stream(data);
    let decode_error = |e: crate::assertion::AssertionError| SigningError::DecodeAssertion(e.to_string());

    let serial_request = match decoder.next() {
        None => return Err(SigningError::EmptyData),
        Some(decoded) => decoded.map_err(decode_error)?,
    };
    if serial_request.assertion_type() != AssertionType::SerialRequest {
        return Err(SigningError::InvalidType);
    }

    let model = decoder.next().transpose().map_err(decode_error)?;
    if let Some(model) = &model {
        if model.assertion_type() != AssertionType::Model {
            return Err(SigningError::InvalidSecondType);
        }
    }

    match decoder.next() {
        None => Ok(SigningRequest {
            serial_request,
            model,
        }),
        Some(Ok(_)) => Err(SigningError::UnexpectedAssertion),
        Some(Err(e)) => Err(decode_error(e)),
    }
}

/// The `serial` header, else a top-level `serial:` line in the body
fn serial_number(serial_request: &Assertion) -> Option<String> {
    if let Some(serial) = serial_request.header("serial").filter(|s| !s.is_empty()) {
        return Some(serial.to_string());
    }
    let body = std::str::from_utf8(serial_request.body()).ok()?;
    body.lines().find_map(|line| {
        let value = line.strip_prefix("serial:")?.trim();
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}
