//! Private Key Storage Module
//!
//! The keypair store imports signing keys, keeps them sealed at rest and
//! unseals them on demand into the shared [`KeyRegistry`] used for signing.
//!
//! # Backends
//!
//! ## Filesystem
//! - Armored keys are written unencrypted to `<keystore_path>/<key-id>`
//! - The sealed-key field stays empty; OS file permissions (0600) are the
//!   trust boundary
//!
//! ## Database
//! - A fresh random secret is generated per key
//! - `encryption_key = HMAC-SHA256(secret, "<authority-id>/<key-id>")`
//! - Sealed key: `base64(IV || AES-256-CFB(encryption_key, armored key))`
//! - Auth key: `base64(IV || AES-256-CFB(keystore_secret, encryption_key))`,
//!   stored in the settings table under `"<authority-id>/<key-id>"`
//!
//! ## TPM 2.0
//! - Same two-level scheme, but `encryption_key` is an HMAC computed inside
//!   the TPM with a persistent keyed-hash key (see [`crate::tpm20`])
//!
//! AES keys shorter than 32 bytes, including the configured keystore secret,
//! are right-padded with `x`; longer ones are truncated.
//!
//! # Example
//!
//! ```no_run
//! use serial_vault::assertion::{AssertionType, Headers};
//! use serial_vault::private_key_storage::{KeypairStore, KeystoreBackend};
//! use serial_vault::storage::MemoryDatastore;
//! use secrecy::SecretString;
//! use std::sync::Arc;
//!
//! # async fn example(armored: &[u8], headers: Headers) -> anyhow::Result<()> {
//! let secret = SecretString::new("keystore secret".to_string());
//! let store = KeypairStore::new(KeystoreBackend::Database, &secret, Arc::new(MemoryDatastore::new()));
//!
//! let (key_id, sealed_key) = store.import("acme", armored).await?;
//! let serial = store
//!     .sign(AssertionType::Serial, headers, Vec::new(), "acme", &key_id, &sealed_key)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::assertion::{Assertion, AssertionError, AssertionType, Headers};
use crate::configs::{AppConfig, KeystoreType};
use crate::encryption::{
    decrypt_from_base64, encrypt_to_base64, generate_key_secret, hmac_sha256, pad_secret,
    setting_code,
};
use crate::key_registry::{KeyRegistry, SigningKeyHandle};
use crate::openpgp::{OpenPgpError, RsaPrivateKey};
use crate::storage::{Datastore, Setting};
use crate::tpm20::{SystemCommandRunner, Tpm20Operator};
use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use secrecy::{ExposeSecret, SecretString, SecretVec};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// The key could not be unsealed; the cause is logged, not carried
    #[error("signing key {0} is unavailable")]
    KeyUnavailable(String),

    #[error("{0} is not supported by the filesystem keystore")]
    NotSupported(&'static str),

    #[error(transparent)]
    Assertion(#[from] AssertionError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Where and how signing keys are kept at rest
pub enum KeystoreBackend {
    Filesystem { path: PathBuf },
    Database,
    Tpm20(Tpm20Operator),
}

impl KeystoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            KeystoreBackend::Filesystem { .. } => "filesystem",
            KeystoreBackend::Database => "database",
            KeystoreBackend::Tpm20(_) => "tpm2.0",
        }
    }
}

pub struct KeypairStore {
    backend: KeystoreBackend,
    master_key: SecretVec<u8>,
    datastore: Arc<dyn Datastore>,
    registry: KeyRegistry,
}

impl KeypairStore {
    pub fn new(
        backend: KeystoreBackend,
        keystore_secret: &SecretString,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        let master_key = pad_secret(keystore_secret.expose_secret().as_bytes()).to_vec();
        Self {
            backend,
            master_key: SecretVec::new(master_key),
            datastore,
            registry: KeyRegistry::new(),
        }
    }

    /// Open the keystore selected by the configuration
    pub fn open(config: &AppConfig, datastore: Arc<dyn Datastore>) -> anyhow::Result<Self> {
        let backend = match config.keystore_type {
            KeystoreType::Filesystem => {
                fs::create_dir_all(&config.keystore_path)
                    .context("Failed to create key store directory")?;
                KeystoreBackend::Filesystem {
                    path: config.keystore_path.clone(),
                }
            }
            KeystoreType::Database => KeystoreBackend::Database,
            KeystoreType::Tpm20 => KeystoreBackend::Tpm20(Tpm20Operator::new(
                Arc::new(SystemCommandRunner),
                config.keystore_path.clone(),
            )),
        };
        info!(backend = backend.name(), "Opened keypair store");
        Ok(Self::new(backend, &config.keystore_secret, datastore))
    }

    pub fn backend(&self) -> &KeystoreBackend {
        &self.backend
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Import an armored private key, returning its key-id and sealed form
    pub async fn import(&self, authority_id: &str, armored: &[u8]) -> Result<(String, String)> {
        let key = parse_armored(armored)?;
        let key_id = key.public_key().id().to_string();

        let sealed_key = match &self.backend {
            KeystoreBackend::Filesystem { path } => {
                let key_path = path.join(&key_id);
                fs::write(&key_path, armored).context("Failed to write signing key")?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
                        .context("Failed to restrict signing key permissions")?;
                }
                self.registry.insert(&key)?;
                String::new()
            }
            KeystoreBackend::Database | KeystoreBackend::Tpm20(_) => {
                let secret = generate_key_secret()?;
                let (sealed_key, auth_key) = self
                    .seal(
                        authority_id,
                        &key_id,
                        armored,
                        &secret,
                        self.master_key.expose_secret(),
                    )
                    .await?;
                self.datastore
                    .put_setting(Setting {
                        code: setting_code(authority_id, &key_id),
                        data: auth_key,
                    })
                    .await
                    .context("Failed to store the signing key auth-key")?;
                sealed_key
            }
        };

        info!(
            authority_id,
            key_id = key_id.as_str(),
            backend = self.backend.name(),
            "Imported signing key"
        );
        Ok((key_id, sealed_key))
    }

    /// Pre-warm the registry; nothing to do for the filesystem backend
    pub async fn load(&self, authority_id: &str, key_id: &str, sealed_key: &str) -> Result<()> {
        if let KeystoreBackend::Filesystem { .. } = self.backend {
            return Ok(());
        }
        self.ensure_loaded(authority_id, key_id, sealed_key).await?;
        Ok(())
    }

    /// Load every active keypair so the first requests skip the unseal.
    ///
    /// A key that fails to unseal is logged and skipped; signing with it
    /// retries later. Returns the number of keys loaded.
    pub async fn load_active(&self) -> anyhow::Result<usize> {
        let keypairs = self
            .datastore
            .list_keypairs()
            .await
            .context("Failed to list keypairs")?;

        let mut loaded = 0;
        for keypair in keypairs.iter().filter(|k| k.active) {
            match self
                .load(&keypair.authority_id, &keypair.key_id, &keypair.sealed_key)
                .await
            {
                Ok(()) => loaded += 1,
                Err(e) => warn!(
                    authority_id = keypair.authority_id.as_str(),
                    key_id = keypair.key_id.as_str(),
                    error = %e,
                    "Skipping signing key at startup"
                ),
            }
        }
        info!(loaded, total = keypairs.len(), "Loaded signing keys");
        Ok(loaded)
    }

    /// Sign an assertion with a stored key, unsealing it first when needed
    pub async fn sign(
        &self,
        assertion_type: AssertionType,
        headers: Headers,
        body: Vec<u8>,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
    ) -> Result<Assertion> {
        let handle = self.ensure_loaded(authority_id, key_id, sealed_key).await?;
        let assertion =
            handle.with_key(|key| Assertion::sign(assertion_type, headers, body, key))??;
        Ok(assertion)
    }

    /// Build an account-key-request self-signed by the stored key
    pub async fn account_key_request(
        &self,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
        account_id: &str,
        name: &str,
    ) -> Result<Assertion> {
        let handle = self.ensure_loaded(authority_id, key_id, sealed_key).await?;
        let assertion = handle.with_key(|key| {
            let mut headers = Headers::new();
            headers.set("account-id", account_id);
            headers.set("name", name);
            headers.set("public-key-sha3-384", key.public_key().id());
            headers.set(
                "since",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            let body = STANDARD.encode(key.public_key().encoded()).into_bytes();
            Assertion::sign_without_authority(AssertionType::AccountKeyRequest, headers, body, key)
        })??;
        Ok(assertion)
    }

    /// Recover the armored key exactly as it was imported
    pub async fn unseal_armored(
        &self,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
    ) -> anyhow::Result<SecretVec<u8>> {
        let (armored, _) = self.unseal(authority_id, key_id, sealed_key).await?;
        Ok(armored)
    }

    /// Decrypt a stored key and check it is the key named by `key_id`.
    ///
    /// CFB carries no integrity check, so a wrong keystore secret or a
    /// corrupted auth-key only shows up here.
    async fn unseal(
        &self,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
    ) -> anyhow::Result<(SecretVec<u8>, RsaPrivateKey)> {
        let armored = match &self.backend {
            KeystoreBackend::Filesystem { path } => fs::read(path.join(key_id))
                .context(format!("Failed to read signing key {}", key_id))?,
            KeystoreBackend::Database | KeystoreBackend::Tpm20(_) => {
                let code = setting_code(authority_id, key_id);
                let setting = self
                    .datastore
                    .get_setting(&code)
                    .await?
                    .ok_or_else(|| anyhow!("Cannot find the auth-key for signing key {}", code))?;
                let encryption_key =
                    decrypt_from_base64(self.master_key.expose_secret(), &setting.data)
                        .context("Could not decrypt the auth-key")?;
                decrypt_from_base64(&pad_secret(&encryption_key), sealed_key)
                    .context("Could not decrypt the signing key")?
            }
        };
        let armored = SecretVec::new(armored);

        let key = RsaPrivateKey::from_armored(armored.expose_secret())
            .context("Could not parse the unsealed signing key")?;
        if key.public_key().id() != key_id {
            return Err(anyhow!(
                "Unsealed key {} does not match signing key {}",
                key.public_key().id(),
                key_id
            ));
        }
        Ok((armored, key))
    }

    /// Re-seal a key for a vault whose keystore secret is `new_secret`.
    ///
    /// Returns the new `(sealed_key, encrypted_auth_key)` pair; nothing is
    /// persisted. The auth-key is encrypted with `new_secret`, so the pair
    /// unseals only under that secret. The TPM backend derives the
    /// encryption key inside the TPM.
    pub async fn reencrypt(
        &self,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
        new_secret: &str,
    ) -> Result<(String, String)> {
        if let KeystoreBackend::Filesystem { .. } = self.backend {
            return Err(KeystoreError::NotSupported("key re-encryption"));
        }
        let (armored, _) = self
            .unseal(authority_id, key_id, sealed_key)
            .await
            .map_err(|e| self.unavailable(authority_id, key_id, e))?;
        let recipient_key = pad_secret(new_secret.as_bytes());
        let pair = self
            .seal(
                authority_id,
                key_id,
                armored.expose_secret(),
                new_secret,
                &recipient_key,
            )
            .await?;
        Ok(pair)
    }

    async fn seal(
        &self,
        authority_id: &str,
        key_id: &str,
        armored: &[u8],
        secret: &str,
        keystore_key: &[u8],
    ) -> anyhow::Result<(String, String)> {
        let encryption_key = self.derive_encryption_key(authority_id, key_id, secret).await?;
        let sealed_key = encrypt_to_base64(&pad_secret(&encryption_key), armored)?;
        let auth_key = encrypt_to_base64(keystore_key, &encryption_key)?;
        Ok((sealed_key, auth_key))
    }

    async fn derive_encryption_key(
        &self,
        authority_id: &str,
        key_id: &str,
        secret: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let code = setting_code(authority_id, key_id);
        match &self.backend {
            KeystoreBackend::Tpm20(operator) => {
                operator.ensure_hash_key(self.datastore.as_ref()).await?;
                operator.hmac(code.as_bytes()).await
            }
            _ => hmac_sha256(secret.as_bytes(), code.as_bytes()),
        }
    }

    async fn ensure_loaded(
        &self,
        authority_id: &str,
        key_id: &str,
        sealed_key: &str,
    ) -> Result<Arc<SigningKeyHandle>> {
        self.registry
            .get_or_unseal(key_id, move || async move {
                self.unseal(authority_id, key_id, sealed_key)
                    .await
                    .map(|(_, key)| key)
            })
            .await
            .map_err(|e| self.unavailable(authority_id, key_id, e))
    }

    fn unavailable(&self, authority_id: &str, key_id: &str, e: anyhow::Error) -> KeystoreError {
        let cause = format!("{:#}", e);
        error!(authority_id, key_id, error = %cause, "Failed to unseal signing key");
        KeystoreError::KeyUnavailable(key_id.to_string())
    }
}

fn parse_armored(armored: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_armored(armored).map_err(|e| match e {
        OpenPgpError::UnsupportedAlgorithm(_) | OpenPgpError::EncryptedSecretKey => {
            KeystoreError::UnsupportedKey(e.to_string())
        }
        OpenPgpError::Crypto(_) => KeystoreError::Internal(e.into()),
        _ => KeystoreError::MalformedKey(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatastore;
    use crate::tpm20::testing::MockCommandRunner;

    fn secret() -> SecretString {
        SecretString::new("the keystore secret".to_string())
    }

    fn serial_headers() -> Headers {
        [
            ("authority-id", "acme"),
            ("brand-id", "acme"),
            ("model", "alder"),
            ("serial", "A123"),
            ("device-key", "AAAA"),
            ("device-key-sha3-384", "device"),
            ("timestamp", "2026-01-01T00:00:00Z"),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_database_import_unseal_roundtrip() {
        let datastore = Arc::new(MemoryDatastore::new());
        let store = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore.clone());
        let key = RsaPrivateKey::generate(2048).unwrap();
        let armored = key.to_armored().unwrap();

        let (key_id, sealed_key) = store.import("acme", armored.as_bytes()).await.unwrap();
        assert_eq!(key_id, key.public_key().id());
        assert!(!sealed_key.is_empty());
        assert!(!sealed_key.contains("PGP"));
        let code = setting_code("acme", &key_id);
        assert!(datastore.get_setting(&code).await.unwrap().is_some());

        let recovered = store.unseal_armored("acme", &key_id, &sealed_key).await.unwrap();
        assert_eq!(recovered.expose_secret(), armored.as_bytes());
    }

    #[tokio::test]
    async fn test_database_sign_unseals_lazily() {
        let datastore = Arc::new(MemoryDatastore::new());
        let store = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore);
        let key = RsaPrivateKey::generate(2048).unwrap();
        let (key_id, sealed_key) = store
            .import("acme", key.to_armored().unwrap().as_bytes())
            .await
            .unwrap();
        assert!(!store.registry().contains(&key_id));

        let serial = store
            .sign(AssertionType::Serial, serial_headers(), Vec::new(), "acme", &key_id, &sealed_key)
            .await
            .unwrap();
        assert_eq!(serial.sign_key_id(), key_id);
        serial.verify(key.public_key()).unwrap();
        assert!(store.registry().contains(&key_id));
    }

    #[tokio::test]
    async fn test_wrong_secret_makes_key_unavailable() {
        let datastore = Arc::new(MemoryDatastore::new());
        let key = RsaPrivateKey::generate(2048).unwrap();
        let importer = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore.clone());
        let (key_id, sealed_key) = importer
            .import("acme", key.to_armored().unwrap().as_bytes())
            .await
            .unwrap();

        let other = SecretString::new("a different secret".to_string());
        let store = KeypairStore::new(KeystoreBackend::Database, &other, datastore);
        let result = store.load("acme", &key_id, &sealed_key).await;
        assert!(matches!(result, Err(KeystoreError::KeyUnavailable(_))));
        assert!(store.registry().is_empty());
    }

    #[tokio::test]
    async fn test_missing_setting_is_unavailable() {
        let store = KeypairStore::new(
            KeystoreBackend::Database,
            &secret(),
            Arc::new(MemoryDatastore::new()),
        );
        let result = store
            .sign(AssertionType::Serial, serial_headers(), Vec::new(), "acme", "nope", "AAAA")
            .await;
        assert!(matches!(result, Err(KeystoreError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(MemoryDatastore::new());
        let backend = KeystoreBackend::Filesystem {
            path: dir.path().to_path_buf(),
        };
        let store = KeypairStore::new(backend, &secret(), datastore.clone());
        let key = RsaPrivateKey::generate(2048).unwrap();
        let armored = key.to_armored().unwrap();

        let (key_id, sealed_key) = store.import("acme", armored.as_bytes()).await.unwrap();
        assert_eq!(sealed_key, "");
        assert_eq!(
            fs::read_to_string(dir.path().join(&key_id)).unwrap(),
            armored
        );

        // A fresh store reads the key file on first use
        let backend = KeystoreBackend::Filesystem {
            path: dir.path().to_path_buf(),
        };
        let fresh = KeypairStore::new(backend, &secret(), datastore);
        fresh.load("acme", &key_id, "").await.unwrap();
        assert!(fresh.registry().is_empty());
        let serial = fresh
            .sign(AssertionType::Serial, serial_headers(), Vec::new(), "acme", &key_id, "")
            .await
            .unwrap();
        serial.verify(key.public_key()).unwrap();

        assert!(matches!(
            fresh.reencrypt("acme", &key_id, "", "new").await,
            Err(KeystoreError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_tpm_backend_with_mock_runner() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(MemoryDatastore::new());
        let runner = Arc::new(MockCommandRunner::new());
        let operator = Tpm20Operator::new(runner.clone(), dir.path());
        operator.initialize(datastore.as_ref()).await.unwrap();

        let store = KeypairStore::new(KeystoreBackend::Tpm20(operator), &secret(), datastore);
        let key = RsaPrivateKey::generate(2048).unwrap();
        let armored = key.to_armored().unwrap();
        let (key_id, sealed_key) = store.import("acme", armored.as_bytes()).await.unwrap();
        assert!(runner.programs().contains(&"tpm2_hmac".to_string()));

        let recovered = store.unseal_armored("acme", &key_id, &sealed_key).await.unwrap();
        assert_eq!(recovered.expose_secret(), armored.as_bytes());
        store.load("acme", &key_id, &sealed_key).await.unwrap();
        assert!(store.registry().contains(&key_id));
    }

    #[tokio::test]
    async fn test_reencrypt_for_another_keystore_secret() {
        let key = RsaPrivateKey::generate(2048).unwrap();
        let armored = key.to_armored().unwrap();
        let store = KeypairStore::new(
            KeystoreBackend::Database,
            &secret(),
            Arc::new(MemoryDatastore::new()),
        );
        let (key_id, sealed_key) = store.import("acme", armored.as_bytes()).await.unwrap();

        let (resealed, auth_key) = store
            .reencrypt("acme", &key_id, &sealed_key, "factory secret")
            .await
            .unwrap();
        assert_ne!(resealed, sealed_key);

        // A vault configured with the new secret unseals the pair
        let factory_datastore = Arc::new(MemoryDatastore::new());
        factory_datastore
            .put_setting(Setting {
                code: setting_code("acme", &key_id),
                data: auth_key.clone(),
            })
            .await
            .unwrap();
        let factory_secret = SecretString::new("factory secret".to_string());
        let factory = KeypairStore::new(
            KeystoreBackend::Database,
            &factory_secret,
            factory_datastore,
        );
        let recovered = factory
            .unseal_armored("acme", &key_id, &resealed)
            .await
            .unwrap();
        assert_eq!(recovered.expose_secret(), armored.as_bytes());
        let serial = factory
            .sign(AssertionType::Serial, serial_headers(), Vec::new(), "acme", &key_id, &resealed)
            .await
            .unwrap();
        serial.verify(key.public_key()).unwrap();

        // The original secret no longer opens it
        let original_datastore = Arc::new(MemoryDatastore::new());
        original_datastore
            .put_setting(Setting {
                code: setting_code("acme", &key_id),
                data: auth_key,
            })
            .await
            .unwrap();
        let original = KeypairStore::new(KeystoreBackend::Database, &secret(), original_datastore);
        assert!(original
            .unseal_armored("acme", &key_id, &resealed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reencrypt_with_wrong_keystore_secret_fails() {
        let datastore = Arc::new(MemoryDatastore::new());
        let key = RsaPrivateKey::generate(2048).unwrap();
        let importer = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore.clone());
        let (key_id, sealed_key) = importer
            .import("acme", key.to_armored().unwrap().as_bytes())
            .await
            .unwrap();

        let other = SecretString::new("a different secret".to_string());
        let store = KeypairStore::new(KeystoreBackend::Database, &other, datastore);
        assert!(store.unseal_armored("acme", &key_id, &sealed_key).await.is_err());
        let result = store
            .reencrypt("acme", &key_id, &sealed_key, "factory secret")
            .await;
        assert!(matches!(result, Err(KeystoreError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unseal_rejects_key_under_wrong_id() {
        let datastore = Arc::new(MemoryDatastore::new());
        let store = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore.clone());
        let key = RsaPrivateKey::generate(2048).unwrap();
        let (key_id, sealed_key) = store
            .import("acme", key.to_armored().unwrap().as_bytes())
            .await
            .unwrap();

        // Same sealed material filed under another key-id
        let setting = datastore
            .get_setting(&setting_code("acme", &key_id))
            .await
            .unwrap()
            .unwrap();
        datastore
            .put_setting(Setting {
                code: setting_code("acme", "other-key"),
                data: setting.data,
            })
            .await
            .unwrap();
        assert!(store
            .unseal_armored("acme", "other-key", &sealed_key)
            .await
            .is_err());
        let result = store.load("acme", "other-key", &sealed_key).await;
        assert!(matches!(result, Err(KeystoreError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn test_load_active_skips_inactive() {
        use crate::storage::Keypair;

        let datastore = Arc::new(MemoryDatastore::new());
        let store = KeypairStore::new(KeystoreBackend::Database, &secret(), datastore.clone());
        let mut ids = Vec::new();
        for active in [true, false] {
            let key = RsaPrivateKey::generate(2048).unwrap();
            let (key_id, sealed_key) = store
                .import("acme", key.to_armored().unwrap().as_bytes())
                .await
                .unwrap();
            let mut keypair = Keypair::new("acme", &key_id, &sealed_key);
            keypair.active = active;
            datastore.put_keypair(keypair).await.unwrap();
            ids.push(key_id);
        }

        // An active key whose auth-key is gone is skipped
        datastore
            .put_keypair(Keypair::new("acme", "orphan", "AAAA"))
            .await
            .unwrap();

        assert_eq!(store.load_active().await.unwrap(), 1);
        assert!(store.registry().contains(&ids[0]));
        assert!(!store.registry().contains(&ids[1]));
        assert!(!store.registry().contains("orphan"));
    }

    #[tokio::test]
    async fn test_import_rejects_bad_keys() {
        let store = KeypairStore::new(
            KeystoreBackend::Database,
            &secret(),
            Arc::new(MemoryDatastore::new()),
        );
        let result = store.import("acme", b"not an armored key").await;
        assert!(matches!(result, Err(KeystoreError::MalformedKey(_))));
    }

    #[tokio::test]
    async fn test_account_key_request() {
        let store = KeypairStore::new(
            KeystoreBackend::Database,
            &secret(),
            Arc::new(MemoryDatastore::new()),
        );
        let key = RsaPrivateKey::generate(2048).unwrap();
        let (key_id, sealed_key) = store
            .import("acme", key.to_armored().unwrap().as_bytes())
            .await
            .unwrap();

        let request = store
            .account_key_request("acme", &key_id, &sealed_key, "acme", "factory")
            .await
            .unwrap();
        assert_eq!(request.assertion_type(), AssertionType::AccountKeyRequest);
        assert_eq!(request.header("public-key-sha3-384"), Some(key_id.as_str()));
        request.verify(key.public_key()).unwrap();
    }
}
