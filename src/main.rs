//! Serial Vault
//!
//! Signs serial assertions for devices during factory provisioning. Devices
//! fetch a nonce, send a self-signed serial-request, and receive a serial
//! assertion signed with their model's key.
//!
//! # Quick Start
//!
//! ```bash
//! # Create the tables
//! serial-vault --config settings.toml createdb
//!
//! # Import a brand signing key
//! serial-vault import-key --authority-id acme --file acme.asc
//!
//! # Serve the signing API
//! serial-vault serve
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serial_vault::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use serial_vault::private_key_storage::KeypairStore;
use serial_vault::signer::Signer;
use serial_vault::sql_storage::SqlDatastore;
use serial_vault::storage::{Datastore, Keypair};
use serial_vault::tpm20::{SystemCommandRunner, Tpm20Operator};
use serial_vault::webserver::start_webserver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "serial-vault")]
#[command(about = "Serial assertion signing service", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "SERIAL_VAULT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the signing API (default)
    Serve,

    /// Create the database tables and exit
    Createdb,

    /// Take TPM ownership and create the primary key
    #[command(name = "tpm2-init")]
    Tpm2Init,

    /// Import an armored signing key into the keystore
    ImportKey {
        #[arg(long)]
        authority_id: String,

        /// Armored private key file
        #[arg(long)]
        file: PathBuf,

        /// Display name stored with the keypair
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_file(&cli.config)?;
    let datastore: Arc<dyn Datastore> =
        Arc::new(SqlDatastore::connect(config.driver, &config.data_source).await?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, datastore).await,
        Commands::Createdb => {
            datastore.create_tables().await?;
            info!("Database tables created");
            Ok(())
        }
        Commands::Tpm2Init => {
            datastore.create_tables().await?;
            let operator =
                Tpm20Operator::new(Arc::new(SystemCommandRunner), config.keystore_path.clone());
            let context = operator.initialize(datastore.as_ref()).await?;
            info!(context = %context.display(), "TPM keystore initialized");
            Ok(())
        }
        Commands::ImportKey {
            authority_id,
            file,
            name,
        } => import_key(&config, datastore, &authority_id, &file, name).await,
    }
}

async fn serve(config: AppConfig, datastore: Arc<dyn Datastore>) -> Result<()> {
    datastore.create_tables().await?;
    let keystore = Arc::new(KeypairStore::open(&config, datastore.clone())?);
    keystore.load_active().await?;

    let signer = Arc::new(Signer::new(datastore, keystore));
    start_webserver(&config.server, signer).await
}

async fn import_key(
    config: &AppConfig,
    datastore: Arc<dyn Datastore>,
    authority_id: &str,
    file: &Path,
    name: Option<String>,
) -> Result<()> {
    datastore.create_tables().await?;
    let armored = std::fs::read(file)
        .context(format!("Failed to read key file: {}", file.display()))?;
    let keystore = KeypairStore::open(config, datastore.clone())?;
    let (key_id, sealed_key) = keystore.import(authority_id, &armored).await?;

    let mut keypair = Keypair::new(authority_id, &key_id, &sealed_key);
    keypair.key_name = name.unwrap_or_default();
    let id = datastore.put_keypair(keypair).await?;
    info!(id, authority_id, key_id = key_id.as_str(), "Keypair stored");
    println!("{}", key_id);
    Ok(())
}
