use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "settings.toml";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub keystore_type: KeystoreType,
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,
    /// Master secret; padded or truncated to 32 bytes before use as an AES key
    pub keystore_secret: SecretString,
    #[serde(default = "default_driver")]
    pub driver: Driver,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreType {
    #[serde(rename = "filesystem")]
    Filesystem,
    #[serde(rename = "database")]
    Database,
    #[serde(rename = "tpm2.0")]
    Tpm20,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    #[serde(rename = "sqlite3")]
    Sqlite3,
    #[serde(rename = "postgres")]
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// TLS is served only when both paths are set
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl ServerConfig {
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("keystore")
}

fn default_driver() -> Driver {
    Driver::Sqlite3
}

fn default_data_source() -> String {
    "sqlite://serial-vault.db?mode=rwc".to_string()
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        toml::from_str(config_str).context("Failed to parse config file")
    }

    /// Load configuration with default path (settings.toml)
    pub fn load() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }
}
