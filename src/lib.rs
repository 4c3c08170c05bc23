//! Serial Vault - Serial Assertion Signing Service
//!
//! Factory-line devices prove their identity with a self-signed
//! `serial-request`; the vault answers with a `serial` assertion signed by
//! the brand's key for that device model. Signing keys never leave the vault
//! unsealed.
//!
//! # Overview
//!
//! ```text
//! POST /v1/nonce    -> request-id (single use, 10 minutes)
//! POST /v1/serial   -> serial-request [+ model]
//!                      API key -> decode -> self-signature -> nonce
//!                      -> model -> serial number -> revision
//!                      -> unseal + sign -> signing log -> serial
//! ```
//!
//! # Module Overview
//!
//! ## Wire format
//!
//! - [`openpgp`]: RSA keys and signatures as OpenPGP packets, ASCII armor,
//!   key-ids (SHA3-384)
//! - [`assertion`]: the assertion text format, signing and verification,
//!   streaming decoder
//!
//! ## Keys
//!
//! - [`private_key_storage`]: the keypair store with filesystem, database and
//!   TPM 2.0 backends
//! - [`key_registry`]: unsealed keys held in memory for signing
//! - [`encryption`]: AES-256-CFB sealing and HMAC key derivation
//! - [`tpm20`]: `tpm2-tools` driver behind an injectable command runner
//!
//! ## Persistence
//!
//! - [`storage`]: the [`storage::Datastore`] trait, row types and an
//!   in-memory implementation
//! - [`sql_storage`]: sqlx implementation for sqlite3 and postgres
//!
//! ## Signing
//!
//! - [`nonce`]: single-use device nonces
//! - [`signing_log`]: duplicate detection and revisions
//! - [`signer`]: the pipeline and its wire error codes
//! - [`protocol`] / [`webserver`]: JSON envelopes and the axum router
//! - [`configs`]: TOML configuration
//!
//! # Example
//!
//! ```no_run
//! use serial_vault::configs::AppConfig;
//! use serial_vault::private_key_storage::KeypairStore;
//! use serial_vault::signer::Signer;
//! use serial_vault::sql_storage::SqlDatastore;
//! use serial_vault::storage::Datastore;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let datastore: Arc<dyn Datastore> =
//!     Arc::new(SqlDatastore::connect(config.driver, &config.data_source).await?);
//! datastore.create_tables().await?;
//!
//! let keystore = Arc::new(KeypairStore::open(&config, datastore.clone())?);
//! let signer = Signer::new(datastore, keystore);
//!
//! let nonce = signer.request_id("ApiKey123456").await?;
//! println!("request-id: {}", nonce.nonce);
//! # Ok(())
//! # }
//! ```
//!
//! # Security Considerations
//!
//! - The keystore secret is padded with `x` or truncated to 32 bytes. This
//!   keeps existing sealed keys readable; it is not a key-derivation function.
//! - Unsealed keys live in memory as zeroize-on-drop DER, and key material is
//!   redacted from `Debug` output.
//! - Keystore failures reach clients only as `signing-assertion`; the cause
//!   is logged.

pub mod assertion;
pub mod configs;
pub mod encryption;
pub mod key_registry;
pub mod nonce;
pub mod openpgp;
pub mod private_key_storage;
pub mod protocol;
pub mod signer;
pub mod signing_log;
pub mod sql_storage;
pub mod storage;
pub mod tpm20;
pub mod webserver;
