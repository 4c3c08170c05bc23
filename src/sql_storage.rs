//! sqlx implementation of the persistence port for `sqlite3` and `postgres`
//!
//! Both drivers go through `sqlx::AnyPool`. Integer columns are declared
//! `BIGINT` and flags are stored as integers so every value decodes the same
//! way on either backend; timestamps are RFC 3339 text.

use crate::configs::Driver;
use crate::storage::{
    validate_new_model, validate_signing_log, Datastore, DeviceNonce, Keypair, Model, NewModel,
    NewSigningLog, Setting, SigningLog,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const KEYPAIR_COLUMNS: &str = "id, authority_id, key_id, active, sealed_key, assertion, key_name";
const SIGNINGLOG_COLUMNS: &str =
    "id, make, model, serial_number, fingerprint, revision, created, synced";

pub struct SqlDatastore {
    pool: AnyPool,
    driver: Driver,
}

/// Turn a configured data source into a sqlx connection URL.
/// Bare sqlite paths are opened read-write and created when missing.
pub fn connection_url(driver: Driver, data_source: &str) -> String {
    match driver {
        Driver::Sqlite3 if !data_source.starts_with("sqlite:") => {
            format!("sqlite://{}?mode=rwc", data_source)
        }
        _ => data_source.to_string(),
    }
}

impl SqlDatastore {
    pub async fn connect(driver: Driver, data_source: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let url = connection_url(driver, data_source);

        // An in-memory sqlite database lives and dies with its one connection
        let options = if url.contains(":memory:") {
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new().max_connections(DEFAULT_MAX_CONNECTIONS)
        };
        let pool = options
            .connect(&url)
            .await
            .context("Failed to connect to the database")?;

        info!(?driver, "Connected to datastore");
        Ok(Self { pool, driver })
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    fn schema(&self) -> Vec<String> {
        let id = match self.driver {
            Driver::Sqlite3 => "INTEGER PRIMARY KEY",
            Driver::Postgres => "BIGSERIAL PRIMARY KEY",
        };
        // sqlite3 nonce ids are allocated by the insert itself
        let nonce_id = match self.driver {
            Driver::Sqlite3 => "BIGINT PRIMARY KEY",
            Driver::Postgres => "BIGSERIAL PRIMARY KEY",
        };
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS keypair (
                    id {id},
                    authority_id TEXT NOT NULL,
                    key_id TEXT NOT NULL,
                    active BIGINT NOT NULL DEFAULT 1,
                    sealed_key TEXT NOT NULL DEFAULT '',
                    assertion TEXT NOT NULL DEFAULT '',
                    key_name TEXT NOT NULL DEFAULT '',
                    UNIQUE (authority_id, key_id)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS model (
                    id {id},
                    brand_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    keypair_id BIGINT NOT NULL REFERENCES keypair (id),
                    user_keypair_id BIGINT NOT NULL REFERENCES keypair (id),
                    model_keypair_id BIGINT,
                    api_key TEXT NOT NULL,
                    UNIQUE (brand_id, name)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS model_api_key_idx ON model (api_key)".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS settings (
                    id {id},
                    code TEXT NOT NULL UNIQUE,
                    data TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS signinglog (
                    id {id},
                    make TEXT NOT NULL,
                    model TEXT NOT NULL,
                    serial_number TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    created TEXT NOT NULL,
                    revision BIGINT NOT NULL DEFAULT 1,
                    synced BIGINT NOT NULL DEFAULT 0
                )"
            ),
            "CREATE INDEX IF NOT EXISTS signinglog_device_idx ON signinglog (make, model, serial_number)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS signinglog_fingerprint_idx ON signinglog (fingerprint)"
                .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS devicenonce (
                    id {nonce_id},
                    nonce TEXT NOT NULL UNIQUE,
                    timestamp BIGINT NOT NULL,
                    created TEXT NOT NULL
                )"
            ),
        ]
    }
}

fn keypair_from_row(row: &AnyRow, offset: usize) -> Result<Keypair> {
    Ok(Keypair {
        id: row.try_get(offset)?,
        authority_id: row.try_get(offset + 1)?,
        key_id: row.try_get(offset + 2)?,
        active: row.try_get::<i64, _>(offset + 3)? != 0,
        sealed_key: row.try_get(offset + 4)?,
        assertion: row.try_get(offset + 5)?,
        key_name: row.try_get(offset + 6)?,
    })
}

fn signing_log_from_row(row: &AnyRow) -> Result<SigningLog> {
    let created: String = row.try_get(6)?;
    Ok(SigningLog {
        id: row.try_get(0)?,
        make: row.try_get(1)?,
        model: row.try_get(2)?,
        serial_number: row.try_get(3)?,
        fingerprint: row.try_get(4)?,
        revision: row.try_get(5)?,
        created: DateTime::parse_from_rfc3339(&created)
            .context("Invalid signing log timestamp")?
            .with_timezone(&Utc),
        synced: row.try_get::<i64, _>(7)? != 0,
    })
}

#[async_trait]
impl Datastore for SqlDatastore {
    async fn create_tables(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin tx")?;
        for statement in self.schema() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .context("Failed to create tables")?;
        }
        tx.commit().await.context("commit schema")?;
        Ok(())
    }

    async fn check_api_key(&self, api_key: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM model WHERE api_key = $1")
            .bind(api_key)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check API key")?;
        Ok(count > 0)
    }

    async fn find_model(&self, brand_id: &str, name: &str, api_key: &str) -> Result<Option<Model>> {
        let row = sqlx::query(
            "SELECT m.id, m.brand_id, m.name, m.api_key, m.model_keypair_id,
                    k.id, k.authority_id, k.key_id, k.active, k.sealed_key, k.assertion, k.key_name,
                    u.id, u.authority_id, u.key_id, u.active, u.sealed_key, u.assertion, u.key_name
             FROM model m
             INNER JOIN keypair k ON k.id = m.keypair_id
             INNER JOIN keypair u ON u.id = m.user_keypair_id
             WHERE m.brand_id = $1 AND m.name = $2 AND m.api_key = $3",
        )
        .bind(brand_id)
        .bind(name)
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up model")?;

        row.map(|row| {
            Ok::<_, anyhow::Error>(Model {
                id: row.try_get(0)?,
                brand_id: row.try_get(1)?,
                name: row.try_get(2)?,
                api_key: row.try_get(3)?,
                model_keypair_id: row.try_get(4)?,
                signing_keypair: keypair_from_row(&row, 5)?,
                user_keypair: keypair_from_row(&row, 12)?,
            })
        })
        .transpose()
    }

    async fn create_model(&self, model: NewModel) -> Result<i64> {
        let mut ids = vec![model.keypair_id, model.user_keypair_id];
        ids.extend(model.model_keypair_id);
        let mut keypairs = Vec::with_capacity(ids.len());
        for id in ids {
            let keypair = self
                .get_keypair(id)
                .await?
                .ok_or_else(|| anyhow!("Keypair {} does not exist", id))?;
            keypairs.push(keypair);
        }
        validate_new_model(&model, &keypairs.iter().collect::<Vec<_>>())?;

        sqlx::query_scalar(
            "INSERT INTO model (brand_id, name, keypair_id, user_keypair_id, model_keypair_id, api_key)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&model.brand_id)
        .bind(&model.name)
        .bind(model.keypair_id)
        .bind(model.user_keypair_id)
        .bind(model.model_keypair_id)
        .bind(&model.api_key)
        .fetch_one(&self.pool)
        .await
        .context(format!("Failed to create model {}/{}", model.brand_id, model.name))
    }

    async fn put_keypair(&self, keypair: Keypair) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO keypair (authority_id, key_id, active, sealed_key, assertion, key_name)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (authority_id, key_id) DO UPDATE SET
                active = excluded.active,
                sealed_key = excluded.sealed_key,
                assertion = excluded.assertion,
                key_name = excluded.key_name
             RETURNING id",
        )
        .bind(&keypair.authority_id)
        .bind(&keypair.key_id)
        .bind(keypair.active as i64)
        .bind(&keypair.sealed_key)
        .bind(&keypair.assertion)
        .bind(&keypair.key_name)
        .fetch_one(&self.pool)
        .await
        .context("Failed to store keypair")
    }

    async fn get_keypair(&self, id: i64) -> Result<Option<Keypair>> {
        let row = sqlx::query(&format!("SELECT {KEYPAIR_COLUMNS} FROM keypair WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch keypair")?;
        row.map(|row| keypair_from_row(&row, 0)).transpose()
    }

    async fn list_keypairs(&self) -> Result<Vec<Keypair>> {
        let rows = sqlx::query(&format!("SELECT {KEYPAIR_COLUMNS} FROM keypair ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list keypairs")?;
        rows.iter().map(|row| keypair_from_row(row, 0)).collect()
    }

    async fn toggle_keypair(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE keypair SET active = $1 WHERE id = $2")
            .bind(active as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update keypair")?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Keypair {} does not exist", id));
        }
        Ok(())
    }

    async fn get_setting(&self, code: &str) -> Result<Option<Setting>> {
        let data: Option<String> = sqlx::query_scalar("SELECT data FROM settings WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch setting")?;
        Ok(data.map(|data| Setting {
            code: code.to_string(),
            data,
        }))
    }

    async fn put_setting(&self, setting: Setting) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (code, data) VALUES ($1, $2)
             ON CONFLICT (code) DO UPDATE SET data = excluded.data",
        )
        .bind(&setting.code)
        .bind(&setting.data)
        .execute(&self.pool)
        .await
        .context("Failed to store setting")?;
        Ok(())
    }

    async fn create_device_nonce(&self, nonce: &str, timestamp: i64) -> Result<DeviceNonce> {
        let sql = match self.driver {
            Driver::Sqlite3 => {
                "INSERT INTO devicenonce (id, nonce, timestamp, created)
                 SELECT COALESCE(MAX(id), 0) + 1, $1, $2, $3 FROM devicenonce
                 RETURNING id"
            }
            Driver::Postgres => {
                "INSERT INTO devicenonce (nonce, timestamp, created)
                 VALUES ($1, $2, $3) RETURNING id"
            }
        };
        let id: i64 = sqlx::query_scalar(sql)
            .bind(nonce)
            .bind(timestamp)
            .bind(Utc::now().to_rfc3339())
            .fetch_one(&self.pool)
            .await
            .context("Failed to store nonce")?;
        Ok(DeviceNonce {
            id,
            nonce: nonce.to_string(),
            timestamp,
        })
    }

    async fn delete_expired_device_nonces(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM devicenonce WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to delete expired nonces")?;
        Ok(result.rows_affected())
    }

    async fn delete_device_nonce(&self, nonce: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM devicenonce WHERE nonce = $1")
            .bind(nonce)
            .execute(&self.pool)
            .await
            .context("Failed to delete nonce")?;
        Ok(result.rows_affected())
    }

    async fn signing_log_exists(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM signinglog
             WHERE (make = $1 AND model = $2 AND serial_number = $3) OR fingerprint = $4",
        )
        .bind(make)
        .bind(model)
        .bind(serial_number)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check signing log")?;
        Ok(count > 0)
    }

    async fn signing_log_max_revision(
        &self,
        make: &str,
        model: &str,
        serial_number: &str,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(revision), 0) FROM signinglog
             WHERE make = $1 AND model = $2 AND serial_number = $3",
        )
        .bind(make)
        .bind(model)
        .bind(serial_number)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch signing log revision")
    }

    async fn create_signing_log(&self, entry: NewSigningLog) -> Result<SigningLog> {
        validate_signing_log(&entry)?;
        let created = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO signinglog (make, model, serial_number, fingerprint, created, revision, synced)
             VALUES ($1, $2, $3, $4, $5, $6, 0) RETURNING id",
        )
        .bind(&entry.make)
        .bind(&entry.model)
        .bind(&entry.serial_number)
        .bind(&entry.fingerprint)
        .bind(created.to_rfc3339())
        .bind(entry.revision)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create signing log")?;

        Ok(SigningLog {
            id,
            make: entry.make,
            model: entry.model,
            serial_number: entry.serial_number,
            fingerprint: entry.fingerprint,
            revision: entry.revision,
            created,
            synced: false,
        })
    }

    async fn list_signing_logs(&self) -> Result<Vec<SigningLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {SIGNINGLOG_COLUMNS} FROM signinglog ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list signing logs")?;
        rows.iter().map(signing_log_from_row).collect()
    }
}
