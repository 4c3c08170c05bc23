//! In-memory registry of unsealed signing keys
//!
//! Keys are held as DER inside `secrecy` wrappers so the material is zeroized
//! on drop and never appears in debug output. The registry itself is a
//! reader-writer guarded map from key-id to key; a separate async mutex
//! serializes first-use unsealing so concurrent requests for a cold key
//! unseal it once.

use crate::openpgp::RsaPrivateKey;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret, Zeroize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
struct SecureSigningKey {
    der_bytes: Vec<u8>,
}

impl Zeroize for SecureSigningKey {
    fn zeroize(&mut self) {
        self.der_bytes.zeroize();
    }
}

impl fmt::Debug for SecureSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSigningKey")
            .field("der_bytes", &"<redacted>")
            .finish()
    }
}

/// An unsealed signing key ready for use
pub struct SigningKeyHandle {
    key_id: String,
    private_key: Secret<SecureSigningKey>,
}

impl SigningKeyHandle {
    pub fn new(key: &RsaPrivateKey) -> Result<Self> {
        let der_bytes = key
            .private_key_to_der()
            .context("Failed to convert signing key to DER")?;

        Ok(Self {
            key_id: key.public_key().id().to_string(),
            private_key: Secret::new(SecureSigningKey { der_bytes }),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Run `f` with the key reconstructed only for the duration of the call
    pub fn with_key<T>(&self, f: impl FnOnce(&RsaPrivateKey) -> T) -> Result<T> {
        let der_bytes = &self.private_key.expose_secret().der_bytes;
        let key = RsaPrivateKey::private_key_from_der(der_bytes)
            .context("Failed to reconstruct signing key from secure storage")?;
        Ok(f(&key))
    }
}

impl fmt::Debug for SigningKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyHandle")
            .field("key_id", &self.key_id)
            .field("private_key", &"<securely stored>")
            .finish()
    }
}

#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<String, Arc<SigningKeyHandle>>>,
    unseal_lock: tokio::sync::Mutex<()>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key_id: &str) -> Option<Arc<SigningKeyHandle>> {
        self.keys.read().get(key_id).cloned()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.read().contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn insert(&self, key: &RsaPrivateKey) -> Result<Arc<SigningKeyHandle>> {
        let handle = Arc::new(SigningKeyHandle::new(key)?);
        self.keys
            .write()
            .insert(handle.key_id().to_string(), handle.clone());
        Ok(handle)
    }

    /// Return the registered key, running `unseal` on a miss.
    ///
    /// Failures are returned to the caller and leave the registry untouched,
    /// so a later request retries the unseal.
    pub async fn get_or_unseal<F, Fut>(&self, key_id: &str, unseal: F) -> Result<Arc<SigningKeyHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RsaPrivateKey>>,
    {
        if let Some(handle) = self.get(key_id) {
            return Ok(handle);
        }

        let _guard = self.unseal_lock.lock().await;
        if let Some(handle) = self.get(key_id) {
            return Ok(handle);
        }

        let key = unseal().await?;
        if key.public_key().id() != key_id {
            anyhow::bail!(
                "Unsealed key {} does not match requested key {}",
                key.public_key().id(),
                key_id
            );
        }
        self.insert(&key)
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("keys", &self.keys.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
