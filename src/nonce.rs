//! Single-use, time-bounded nonces handed to devices before they sign a
//! serial-request. Consumption is a row delete, so the datastore decides
//! which of two concurrent callers wins.

use crate::encryption::random_token;
use crate::storage::{Datastore, DeviceNonce};
use chrono::Utc;
use openssl::sha::sha1;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info};

/// Seconds a nonce stays valid after issue
pub const NONCE_EXPIRY_SECS: i64 = 600;

/// Length of the random token hashed into each nonce
const NONCE_TOKEN_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    #[error("nonce is invalid or expired")]
    InvalidOrExpired,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct NonceManager {
    datastore: Arc<dyn Datastore>,
}

impl NonceManager {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Generate, persist and return a fresh nonce
    pub async fn issue(&self) -> Result<DeviceNonce, NonceError> {
        let timestamp = Utc::now().timestamp();
        let token = random_token(NONCE_TOKEN_LENGTH)?;
        let nonce = generate_nonce(&token, timestamp);

        let row = self.datastore.create_device_nonce(&nonce, timestamp).await?;
        debug!(id = row.id, "Issued device nonce");
        Ok(row)
    }

    /// Consume a nonce; succeeds for exactly one caller
    pub async fn consume(&self, nonce: &str) -> Result<(), NonceError> {
        self.sweep_expired().await?;
        match self.datastore.delete_device_nonce(nonce).await? {
            1 => Ok(()),
            _ => Err(NonceError::InvalidOrExpired),
        }
    }

    /// Remove every nonce older than the expiry window
    pub async fn sweep_expired(&self) -> Result<u64, NonceError> {
        let cutoff = Utc::now().timestamp() - NONCE_EXPIRY_SECS;
        let removed = self.datastore.delete_expired_device_nonces(cutoff).await?;
        if removed > 0 {
            info!(removed, "Swept expired device nonces");
        }
        Ok(removed)
    }
}

/// `hex(SHA1(token || timestamp))`
fn generate_nonce(token: &str, timestamp: i64) -> String {
    let digest = sha1(format!("{}{}", token, timestamp).as_bytes());
    digest.iter().fold(String::with_capacity(40), |mut hex, byte| {
        let _ = write!(hex, "{:02x}", byte);
        hex
    })
}
