//! Duplicate detection and per-device revisions.
//!
//! A matching `(make, model, serial)` is not fatal: the device gets the next
//! revision. A reused device-key fingerprint under another serial is only
//! logged for audit.

use crate::storage::{Datastore, NewSigningLog, SigningLog};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SigningLogService {
    datastore: Arc<dyn Datastore>,
}

impl SigningLogService {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// True when the triple or the fingerprint has been signed before
    pub async fn check_existing(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let exists = self
            .datastore
            .signing_log_exists(make, model, serial_number, fingerprint)
            .await
            .context("Failed to check the signing log")?;
        if exists {
            warn!(
                make,
                model,
                serial_number,
                fingerprint,
                "Device was signed before; issuing a new revision"
            );
        }
        Ok(exists)
    }

    /// Highest revision recorded for the device, 0 when there is none
    pub async fn max_revision(&self, make: &str, model: &str, serial_number: &str) -> Result<i64> {
        self.datastore
            .signing_log_max_revision(make, model, serial_number)
            .await
            .context("Failed to read the signing log revision")
    }

    /// Next revision for the device
    pub async fn next_revision(&self, make: &str, model: &str, serial_number: &str) -> Result<i64> {
        Ok(self.max_revision(make, model, serial_number).await? + 1)
    }

    pub async fn record(&self, entry: NewSigningLog) -> Result<SigningLog> {
        let row = self
            .datastore
            .create_signing_log(entry)
            .await
            .context("Failed to write the signing log")?;
        info!(
            make = row.make.as_str(),
            model = row.model.as_str(),
            serial_number = row.serial_number.as_str(),
            revision = row.revision,
            "Recorded signing log"
        );
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatastore;

    fn entry(serial: &str, fingerprint: &str, revision: i64) -> NewSigningLog {
        NewSigningLog {
            make: "acme".to_string(),
            model: "alder".to_string(),
            serial_number: serial.to_string(),
            fingerprint: fingerprint.to_string(),
            revision,
        }
    }

    #[tokio::test]
    async fn test_revisions_increase() {
        let service = SigningLogService::new(Arc::new(MemoryDatastore::new()));
        assert_eq!(service.max_revision("acme", "alder", "A1").await.unwrap(), 0);

        for expected in 1..=3 {
            let revision = service.next_revision("acme", "alder", "A1").await.unwrap();
            assert_eq!(revision, expected);
            service.record(entry("A1", "fp", revision)).await.unwrap();
        }
        assert_eq!(service.max_revision("acme", "alder", "A2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_check_existing_by_triple_or_fingerprint() {
        let service = SigningLogService::new(Arc::new(MemoryDatastore::new()));
        service.record(entry("A1", "fp-1", 1)).await.unwrap();

        assert!(service.check_existing("acme", "alder", "A1", "fp-9").await.unwrap());
        assert!(service.check_existing("acme", "alder", "B2", "fp-1").await.unwrap());
        assert!(!service.check_existing("acme", "alder", "B2", "fp-2").await.unwrap());
        assert!(!service.check_existing("acme", "birch", "A1", "fp-2").await.unwrap());
    }
}
