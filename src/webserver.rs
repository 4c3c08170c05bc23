use crate::assertion::MEDIA_TYPE;
use crate::configs::ServerConfig;
use crate::protocol::{serialize_response, NonceResponse, VersionResponse, JSON_CONTENT_TYPE};
use crate::signer::{Signer, SigningError};
use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Header carrying the model API key
pub const API_KEY_HEADER: &str = "api-key";

pub fn router(signer: Arc<Signer>) -> Router {
    Router::new()
        .route("/v1/version", get(version))
        .route("/v1/nonce", post(request_id))
        .route("/v1/request-id", post(request_id))
        .route("/v1/serial", post(serial))
        .layer(TraceLayer::new_for_http())
        .with_state(signer)
}

/// Serve the signing API until the process is stopped.
///
/// TLS is used when both certificate paths are configured.
pub async fn start_webserver(config: &ServerConfig, signer: Arc<Signer>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;
    let app = router(signer);

    match config.tls_paths() {
        Some((cert_path, key_path)) => {
            let tls = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context("Failed to load TLS certificates")?;
            info!(%addr, "HTTPS server listening");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
                .map_err(|e| anyhow!("HTTPS server failed: {}", e))
        }
        None => {
            info!(%addr, "HTTP server listening");
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| anyhow!("HTTP server failed: {}", e))
        }
    }
}

pub async fn version() -> Result<Response, SigningError> {
    json_response(&VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /v1/nonce` and `POST /v1/request-id`
pub async fn request_id(
    State(signer): State<Arc<Signer>>,
    headers: HeaderMap,
) -> Result<Response, SigningError> {
    let nonce = signer.request_id(api_key(&headers)).await?;
    json_response(&NonceResponse::new(nonce.nonce))
}

/// `POST /v1/serial`: the body is the assertion stream
pub async fn serial(
    State(signer): State<Arc<Signer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SigningError> {
    let signed = signer.sign_serial(api_key(&headers), &body).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, MEDIA_TYPE)],
        signed.encode(),
    )
        .into_response())
}

fn api_key(headers: &HeaderMap) -> &str {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn json_response<T: Serialize>(value: &T) -> Result<Response, SigningError> {
    let body = serialize_response(value)?;
    Ok(([(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_api_key_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key(&headers), "");
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("ApiKey123456"));
        assert_eq!(api_key(&headers), "ApiKey123456");
    }

    #[tokio::test]
    async fn test_version_is_json() {
        let response = version().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], JSON_CONTENT_TYPE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
