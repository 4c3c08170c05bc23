//! TPM 2.0 Operator
//!
//! Wraps the `tpm2-tools` command line programs used by the TPM keystore:
//!
//! - **Initialization**: take ownership and create a primary key whose context
//!   file path is saved in the `parent` setting
//! - **Key creation**: a keyed-hash key under the primary, loaded and made
//!   persistent at [`HANDLE_HASH`]; the handle is recorded as a setting so
//!   the key is only created once
//! - **HMAC**: derives per-key encryption keys inside the TPM
//!
//! Every invocation goes through a [`CommandRunner`] so the operator can be
//! exercised without hardware.

use crate::storage::{Datastore, Setting};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const ALG_SHA256: &str = "0x000B";
pub const ALG_RSA: &str = "0x0001";
pub const ALG_KEYED_HASH: &str = "0x0008";

/// Persistent handle of the keyed-hash key
pub const HANDLE_HASH: &str = "0x81010002";

/// Setting holding the primary key context path
pub const SETTING_PARENT: &str = "parent";

/// Runs one external TPM program
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Runs the real `tpm2-tools` binaries
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .context(format!("Failed to execute {}", program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(program, %stderr, "TPM command failed");
            return Err(anyhow!("{} exited with {}", program, output.status));
        }
        Ok(())
    }
}

pub struct Tpm20Operator {
    runner: Arc<dyn CommandRunner>,
    keystore_path: PathBuf,
}

impl Tpm20Operator {
    pub fn new(runner: Arc<dyn CommandRunner>, keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            keystore_path: keystore_path.into(),
        }
    }

    /// Take ownership of the TPM and create the primary key.
    ///
    /// The context file lands in the keystore directory and its path is
    /// saved in the `parent` setting.
    pub async fn initialize(&self, datastore: &dyn Datastore) -> Result<PathBuf> {
        info!("Initialize the TPM keystore");
        fs::create_dir_all(&self.keystore_path).context("Failed to create keystore directory")?;
        let primary_context = self.keystore_path.join(".primary.ctx");
        let primary = path_arg(&primary_context)?;

        self.runner
            .run("tpm2_takeownership", &["-c"])
            .context("TPM takeownership failed")?;
        self.runner
            .run(
                "tpm2_createprimary",
                &["-A", "o", "-g", ALG_SHA256, "-G", ALG_RSA, "-C", primary],
            )
            .context("TPM createprimary failed")?;

        datastore
            .put_setting(Setting {
                code: SETTING_PARENT.to_string(),
                data: primary.to_string(),
            })
            .await
            .context("Failed to save the parent key path in settings")?;
        Ok(primary_context)
    }

    /// Create the persistent keyed-hash key unless a previous import did
    pub async fn ensure_hash_key(&self, datastore: &dyn Datastore) -> Result<()> {
        if datastore.get_setting(HANDLE_HASH).await?.is_some() {
            debug!("Using the existing TPM hash key");
            return Ok(());
        }
        let parent = datastore
            .get_setting(SETTING_PARENT)
            .await?
            .ok_or_else(|| anyhow!("TPM keystore is not initialized: no parent context"))?;

        // The tools create these files; the directory is removed afterwards
        let workdir = tempfile::Builder::new()
            .prefix(".tpm")
            .tempdir_in(&self.keystore_path)
            .context("Failed to create TPM working directory")?;
        let public_key = workdir.path().join("key.pub");
        let private_key = workdir.path().join("key.prv");
        let name_file = workdir.path().join("key.name");
        let key_context = workdir.path().join("key.ctx");

        self.runner
            .run(
                "tpm2_create",
                &[
                    "-g",
                    ALG_SHA256,
                    "-G",
                    ALG_KEYED_HASH,
                    "-c",
                    &parent.data,
                    "-o",
                    path_arg(&public_key)?,
                    "-O",
                    path_arg(&private_key)?,
                ],
            )
            .context("TPM create failed")?;
        self.runner
            .run(
                "tpm2_load",
                &[
                    "-c",
                    &parent.data,
                    "-u",
                    path_arg(&public_key)?,
                    "-r",
                    path_arg(&private_key)?,
                    "-n",
                    path_arg(&name_file)?,
                    "-C",
                    path_arg(&key_context)?,
                ],
            )
            .context("TPM load failed")?;
        self.runner
            .run(
                "tpm2_evictcontrol",
                &["-A", "o", "-c", path_arg(&key_context)?, "-S", HANDLE_HASH],
            )
            .context("TPM evictcontrol failed")?;

        datastore
            .put_setting(Setting {
                code: HANDLE_HASH.to_string(),
                data: HANDLE_HASH.to_string(),
            })
            .await
            .context("Failed to record the TPM hash key handle")?;
        Ok(())
    }

    /// HMAC-SHA256 of `data` with the persistent keyed-hash key.
    ///
    /// The tools run on the blocking pool.
    pub async fn hmac(&self, data: &[u8]) -> Result<Vec<u8>> {
        let runner = self.runner.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || run_hmac(runner.as_ref(), &data))
            .await
            .context("TPM hmac task failed")?
    }
}

fn run_hmac(runner: &dyn CommandRunner, data: &[u8]) -> Result<Vec<u8>> {
    let workdir = tempfile::tempdir().context("Failed to create HMAC working directory")?;
    let input = workdir.path().join("input");
    let output = workdir.path().join("output");

    fs::write(&input, data).context("Failed to write HMAC input")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&input, fs::Permissions::from_mode(0o600))?;
    }

    runner
        .run(
            "tpm2_hmac",
            &[
                "-k",
                HANDLE_HASH,
                "-g",
                ALG_SHA256,
                "-I",
                path_arg(&input)?,
                "-o",
                path_arg(&output)?,
            ],
        )
        .context("TPM hmac failed")?;

    fs::read(&output).context("Failed to read HMAC output")
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Non UTF-8 path: {}", path.display()))
}

/// A runner for tests: records invocations and fakes `tpm2_hmac` output
#[cfg(test)]
pub(crate) mod testing {
    use super::CommandRunner;
    use anyhow::{anyhow, Result};
    use std::fs;
    use tracing::debug;

    #[derive(Debug, Default)]
    pub struct MockCommandRunner {
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl MockCommandRunner {
        pub const FAKE_HMAC: &'static [u8] = b"fake-hmac-ed-data";

        pub fn new() -> Self {
            Self::default()
        }

        /// Programs invoked so far, in order
        pub fn programs(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl CommandRunner for MockCommandRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<()> {
            debug!(program, "Mock TPM command");
            self.calls.lock().push(program.to_string());
            if program == "tpm2_hmac" {
                let output = args
                    .last()
                    .ok_or_else(|| anyhow!("tpm2_hmac needs an output file"))?;
                fs::write(output, Self::FAKE_HMAC)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockCommandRunner;
    use super::*;
    use crate::storage::MemoryDatastore;

    #[test]
    fn test_system_runner() {
        let runner = SystemCommandRunner;
        assert!(runner.run("ls", &["-l"]).is_ok());
        assert!(runner.run("thisreallyshouldnotwork", &["-l"]).is_err());
    }

    #[tokio::test]
    async fn test_initialize_records_parent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockCommandRunner::new());
        let operator = Tpm20Operator::new(runner.clone(), dir.path());
        let datastore = MemoryDatastore::new();

        let context = operator.initialize(&datastore).await.unwrap();
        let parent = datastore.get_setting(SETTING_PARENT).await.unwrap().unwrap();
        assert_eq!(parent.data, context.to_str().unwrap());
        assert_eq!(
            runner.programs(),
            vec!["tpm2_takeownership", "tpm2_createprimary"]
        );
    }

    #[tokio::test]
    async fn test_hash_key_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockCommandRunner::new());
        let operator = Tpm20Operator::new(runner.clone(), dir.path());
        let datastore = MemoryDatastore::new();

        assert!(operator.ensure_hash_key(&datastore).await.is_err());

        operator.initialize(&datastore).await.unwrap();
        operator.ensure_hash_key(&datastore).await.unwrap();
        operator.ensure_hash_key(&datastore).await.unwrap();
        let creates = runner
            .programs()
            .iter()
            .filter(|p| p.as_str() == "tpm2_create")
            .count();
        assert_eq!(creates, 1);
        assert!(datastore.get_setting(HANDLE_HASH).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hmac_reads_tool_output() {
        let runner = Arc::new(MockCommandRunner::new());
        let operator = Tpm20Operator::new(runner.clone(), "unused");
        let digest = operator.hmac(b"acme/key-id").await.unwrap();
        assert_eq!(digest, MockCommandRunner::FAKE_HMAC);
        assert_eq!(runner.programs(), vec!["tpm2_hmac"]);
    }
}
