//! Persistence Port
//!
//! The signing core reaches the relational store only through the
//! [`Datastore`] trait. Two implementations exist:
//!
//! - [`crate::sql_storage::SqlDatastore`]: sqlx over `sqlite3` or `postgres`
//! - [`MemoryDatastore`]: a process-local store for tests and tooling
//!
//! Rows mirror the tables the core touches: `keypair`, `model`, `settings`,
//! `signinglog` and `devicenonce`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Minimum length of a model API key
pub const MIN_API_KEY_LENGTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    pub id: i64,
    pub authority_id: String,
    pub key_id: String,
    pub active: bool,
    pub sealed_key: String,
    pub assertion: String,
    pub key_name: String,
}

impl Keypair {
    pub fn new(authority_id: &str, key_id: &str, sealed_key: &str) -> Self {
        Self {
            id: 0,
            authority_id: authority_id.to_string(),
            key_id: key_id.to_string(),
            active: true,
            sealed_key: sealed_key.to_string(),
            assertion: String::new(),
            key_name: String::new(),
        }
    }
}

/// A model with its signing and user keypairs resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: i64,
    pub brand_id: String,
    pub name: String,
    pub api_key: String,
    pub signing_keypair: Keypair,
    pub user_keypair: Keypair,
    pub model_keypair_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewModel {
    pub brand_id: String,
    pub name: String,
    pub keypair_id: i64,
    pub user_keypair_id: i64,
    pub model_keypair_id: Option<i64>,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub code: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNonce {
    pub id: i64,
    pub nonce: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningLog {
    pub id: i64,
    pub make: String,
    pub model: String,
    pub serial_number: String,
    pub fingerprint: String,
    pub revision: i64,
    pub created: DateTime<Utc>,
    pub synced: bool,
}

#[derive(Debug, Clone)]
pub struct NewSigningLog {
    pub make: String,
    pub model: String,
    pub serial_number: String,
    pub fingerprint: String,
    pub revision: i64,
}

/// Typed data-access contract used by the signing core
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Create any missing tables
    async fn create_tables(&self) -> Result<()>;

    /// True when some model carries this API key
    async fn check_api_key(&self, api_key: &str) -> Result<bool>;
    async fn find_model(&self, brand_id: &str, name: &str, api_key: &str) -> Result<Option<Model>>;
    async fn create_model(&self, model: NewModel) -> Result<i64>;

    /// Insert or update a keypair keyed by `(authority_id, key_id)`
    async fn put_keypair(&self, keypair: Keypair) -> Result<i64>;
    async fn get_keypair(&self, id: i64) -> Result<Option<Keypair>>;
    async fn list_keypairs(&self) -> Result<Vec<Keypair>>;
    async fn toggle_keypair(&self, id: i64, active: bool) -> Result<()>;

    async fn get_setting(&self, code: &str) -> Result<Option<Setting>>;
    async fn put_setting(&self, setting: Setting) -> Result<()>;

    async fn create_device_nonce(&self, nonce: &str, timestamp: i64) -> Result<DeviceNonce>;
    /// Delete nonces issued before `cutoff`; returns the number removed
    async fn delete_expired_device_nonces(&self, cutoff: i64) -> Result<u64>;
    /// Delete one nonce; returns the number of rows removed
    async fn delete_device_nonce(&self, nonce: &str) -> Result<u64>;

    async fn signing_log_exists(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
        fingerprint: &str,
    ) -> Result<bool>;
    async fn signing_log_max_revision(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
    ) -> Result<i64>;
    async fn create_signing_log(&self, entry: NewSigningLog) -> Result<SigningLog>;
    async fn list_signing_logs(&self) -> Result<Vec<SigningLog>>;
}

pub fn valid_api_key(api_key: &str) -> bool {
    api_key.len() >= MIN_API_KEY_LENGTH && api_key.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Model registration rules shared by every datastore
pub fn validate_new_model(model: &NewModel, keypairs: &[&Keypair]) -> Result<()> {
    if model.brand_id.trim().is_empty() || model.name.trim().is_empty() {
        bail!("Model brand and name must not be empty");
    }
    if !valid_api_key(&model.api_key) {
        bail!(
            "API key must be at least {} alphanumeric characters",
            MIN_API_KEY_LENGTH
        );
    }
    if let Some(foreign) = keypairs
        .iter()
        .find(|keypair| keypair.authority_id != model.brand_id)
    {
        bail!(
            "Keypair {} belongs to {}, not to brand {}",
            foreign.key_id,
            foreign.authority_id,
            model.brand_id
        );
    }
    Ok(())
}

pub fn validate_signing_log(entry: &NewSigningLog) -> Result<()> {
    let fields = [
        ("make", &entry.make),
        ("model", &entry.model),
        ("serial number", &entry.serial_number),
        ("fingerprint", &entry.fingerprint),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
        bail!("Signing log {} must not be empty", name);
    }
    Ok(())
}

#[derive(Default)]
struct MemoryState {
    keypairs: Vec<Keypair>,
    models: Vec<(i64, NewModel)>,
    settings: HashMap<String, String>,
    nonces: Vec<DeviceNonce>,
    signing_logs: Vec<SigningLog>,
    next_id: i64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn keypair(&self, id: i64) -> Option<&Keypair> {
        self.keypairs.iter().find(|k| k.id == id)
    }
}

/// In-process datastore with the same semantics as the SQL one
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn check_api_key(&self, api_key: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.models.iter().any(|(_, m)| m.api_key == api_key))
    }

    async fn find_model(&self, brand_id: &str, name: &str, api_key: &str) -> Result<Option<Model>> {
        let state = self.state.lock();
        let Some((id, model)) = state
            .models
            .iter()
            .find(|(_, m)| m.brand_id == brand_id && m.name == name && m.api_key == api_key)
        else {
            return Ok(None);
        };
        // Inner join: a dangling keypair reference hides the model
        let (Some(signing), Some(user)) = (
            state.keypair(model.keypair_id),
            state.keypair(model.user_keypair_id),
        ) else {
            return Ok(None);
        };
        Ok(Some(Model {
            id: *id,
            brand_id: model.brand_id.clone(),
            name: model.name.clone(),
            api_key: model.api_key.clone(),
            signing_keypair: signing.clone(),
            user_keypair: user.clone(),
            model_keypair_id: model.model_keypair_id,
        }))
    }

    async fn create_model(&self, model: NewModel) -> Result<i64> {
        let mut state = self.state.lock();
        let mut ids = vec![model.keypair_id, model.user_keypair_id];
        ids.extend(model.model_keypair_id);
        let keypairs = ids
            .iter()
            .map(|id| {
                state
                    .keypair(*id)
                    .ok_or_else(|| anyhow!("Keypair {} does not exist", id))
            })
            .collect::<Result<Vec<_>>>()?;
        validate_new_model(&model, &keypairs)?;
        if state
            .models
            .iter()
            .any(|(_, m)| m.brand_id == model.brand_id && m.name == model.name)
        {
            bail!("Model {}/{} already exists", model.brand_id, model.name);
        }
        let id = state.allocate_id();
        state.models.push((id, model));
        Ok(id)
    }

    async fn put_keypair(&self, keypair: Keypair) -> Result<i64> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .keypairs
            .iter_mut()
            .find(|k| k.authority_id == keypair.authority_id && k.key_id == keypair.key_id)
        {
            let id = existing.id;
            *existing = Keypair { id, ..keypair };
            return Ok(id);
        }
        let id = state.allocate_id();
        state.keypairs.push(Keypair { id, ..keypair });
        Ok(id)
    }

    async fn get_keypair(&self, id: i64) -> Result<Option<Keypair>> {
        Ok(self.state.lock().keypair(id).cloned())
    }

    async fn list_keypairs(&self) -> Result<Vec<Keypair>> {
        Ok(self.state.lock().keypairs.clone())
    }

    async fn toggle_keypair(&self, id: i64, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        let keypair = state
            .keypairs
            .iter_mut()
            .find(|k| k.id == id)
            .ok_or_else(|| anyhow!("Keypair {} does not exist", id))?;
        keypair.active = active;
        Ok(())
    }

    async fn get_setting(&self, code: &str) -> Result<Option<Setting>> {
        Ok(self.state.lock().settings.get(code).map(|data| Setting {
            code: code.to_string(),
            data: data.clone(),
        }))
    }

    async fn put_setting(&self, setting: Setting) -> Result<()> {
        self.state.lock().settings.insert(setting.code, setting.data);
        Ok(())
    }

    async fn create_device_nonce(&self, nonce: &str, timestamp: i64) -> Result<DeviceNonce> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let row = DeviceNonce {
            id,
            nonce: nonce.to_string(),
            timestamp,
        };
        state.nonces.push(row.clone());
        Ok(row)
    }

    async fn delete_expired_device_nonces(&self, cutoff: i64) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.nonces.len();
        state.nonces.retain(|n| n.timestamp >= cutoff);
        Ok((before - state.nonces.len()) as u64)
    }

    async fn delete_device_nonce(&self, nonce: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.nonces.len();
        state.nonces.retain(|n| n.nonce != nonce);
        Ok((before - state.nonces.len()) as u64)
    }

    async fn signing_log_exists(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.signing_logs.iter().any(|log| {
            (log.make == make && log.model == model && log.serial_number == serial_number)
                || log.fingerprint == fingerprint
        }))
    }

    async fn signing_log_max_revision(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
    ) -> Result<i64> {
        let state = self.state.lock();
        Ok(state
            .signing_logs
            .iter()
            .filter(|log| log.make == make && log.model == model && log.serial_number == serial_number)
            .map(|log| log.revision)
            .max()
            .unwrap_or(0))
    }

    async fn create_signing_log(&self, entry: NewSigningLog) -> Result<SigningLog> {
        validate_signing_log(&entry)?;
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let row = SigningLog {
            id,
            make: entry.make,
            model: entry.model,
            serial_number: entry.serial_number,
            fingerprint: entry.fingerprint,
            revision: entry.revision,
            created: Utc::now(),
            synced: false,
        };
        state.signing_logs.push(row.clone());
        Ok(row)
    }

    async fn list_signing_logs(&self) -> Result<Vec<SigningLog>> {
        let mut logs = self.state.lock().signing_logs.clone();
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryDatastore, i64, i64) {
        let store = MemoryDatastore::new();
        let signing = store.put_keypair(Keypair::new("acme", "signing", "")).await.unwrap();
        let user = store.put_keypair(Keypair::new("acme", "user", "")).await.unwrap();
        (store, signing, user)
    }

    fn new_model(signing: i64, user: i64, api_key: &str) -> NewModel {
        NewModel {
            brand_id: "acme".to_string(),
            name: "alder".to_string(),
            keypair_id: signing,
            user_keypair_id: user,
            model_keypair_id: None,
            api_key: api_key.to_string(),
        }
    }

    #[test]
    fn test_api_key_rules() {
        assert!(valid_api_key("ABCDEFGHIJ"));
        assert!(valid_api_key("abc1234567890"));
        assert!(!valid_api_key("short"));
        assert!(!valid_api_key("has spaces in it"));
        assert!(!valid_api_key("dash-es-are-out"));
    }

    #[tokio::test]
    async fn test_model_lookup_joins_keypairs() {
        let (store, signing, user) = seeded().await;
        store.create_model(new_model(signing, user, "ApiKey123456")).await.unwrap();

        assert!(store.check_api_key("ApiKey123456").await.unwrap());
        assert!(!store.check_api_key("Unknown12345").await.unwrap());

        let model = store
            .find_model("acme", "alder", "ApiKey123456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model.signing_keypair.key_id, "signing");
        assert_eq!(model.user_keypair.key_id, "user");
        assert!(store
            .find_model("acme", "alder", "OtherKey12345")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_model_invariants() {
        let (store, signing, user) = seeded().await;
        let foreign = store.put_keypair(Keypair::new("other", "k", "")).await.unwrap();

        assert!(store.create_model(new_model(signing, user, "short")).await.is_err());
        assert!(store
            .create_model(new_model(foreign, user, "ApiKey123456"))
            .await
            .is_err());
        assert!(store.create_model(new_model(signing, 999, "ApiKey123456")).await.is_err());

        store.create_model(new_model(signing, user, "ApiKey123456")).await.unwrap();
        assert!(store
            .create_model(new_model(signing, user, "ApiKey654321"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_put_keypair_upserts() {
        let (store, signing, _) = seeded().await;
        let mut updated = Keypair::new("acme", "signing", "sealed");
        updated.active = false;
        assert_eq!(store.put_keypair(updated).await.unwrap(), signing);

        let keypair = store.get_keypair(signing).await.unwrap().unwrap();
        assert_eq!(keypair.sealed_key, "sealed");
        assert!(!keypair.active);

        store.toggle_keypair(signing, true).await.unwrap();
        assert!(store.get_keypair(signing).await.unwrap().unwrap().active);
        assert_eq!(store.list_keypairs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_signing_log_blank_fields_rejected() {
        let store = MemoryDatastore::new();
        let entry = NewSigningLog {
            make: "acme".to_string(),
            model: "alder".to_string(),
            serial_number: " ".to_string(),
            fingerprint: "fp".to_string(),
            revision: 1,
        };
        assert!(store.create_signing_log(entry).await.is_err());
        assert!(store.list_signing_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nonce_rows() {
        let store = MemoryDatastore::new();
        store.create_device_nonce("old", 100).await.unwrap();
        store.create_device_nonce("fresh", 1000).await.unwrap();
        assert_eq!(store.delete_expired_device_nonces(500).await.unwrap(), 1);
        assert_eq!(store.delete_device_nonce("old").await.unwrap(), 0);
        assert_eq!(store.delete_device_nonce("fresh").await.unwrap(), 1);
        assert_eq!(store.delete_device_nonce("fresh").await.unwrap(), 0);
    }
}
