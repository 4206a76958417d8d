//! Terraform execution
//!
//! Runs the downloaded `terraform` binary in an entrypoint directory with an
//! injected environment, streaming output into the structured logger. The
//! runner does not interpret terraform output and never retries; a non-zero
//! exit becomes an error carrying the stderr tail so the lifecycle
//! controller can record it as the cluster's lastCondition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::Result;

/// Stderr bytes preserved in the error for lastCondition
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Abstraction over terraform execution, mockable in controller tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TerraformRunner: Send + Sync {
    /// `terraform init` then `terraform apply -auto-approve`
    async fn init_apply_auto_approve(
        &self,
        entrypoint: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// `terraform init` then `terraform destroy -auto-approve`
    async fn init_destroy_auto_approve(
        &self,
        entrypoint: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Runner shelling out to a terraform binary on disk
pub struct TerraformCli {
    binary: PathBuf,
}

impl TerraformCli {
    /// Use the terraform binary at `binary`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        entrypoint: &Path,
        env: &BTreeMap<String, String>,
        args: &[&str],
    ) -> Result<()> {
        let description = format!("terraform {} in {}", args.join(" "), entrypoint.display());
        info!("{description}");

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(entrypoint)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::terraform(format!("{description}: failed to spawn: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "terraform", "{line}");
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut tail = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "terraform", "{line}");
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let cut = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..cut);
                }
            }
            tail
        });

        let status = child
            .wait()
            .await
            .map_err(|e| Error::terraform(format!("{description}: {e}")))?;
        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            info!("{description} succeeded");
            Ok(())
        } else {
            Err(Error::terraform(format!(
                "{description} exited {}: {}",
                status.code().unwrap_or(-1),
                stderr_tail.trim_end()
            )))
        }
    }
}

#[async_trait]
impl TerraformRunner for TerraformCli {
    async fn init_apply_auto_approve(
        &self,
        entrypoint: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.run(entrypoint, env, &["init", "-force-copy"]).await?;
        self.run(entrypoint, env, &["apply", "-auto-approve"]).await
    }

    async fn init_destroy_auto_approve(
        &self,
        entrypoint: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.run(entrypoint, env, &["init", "-force-copy"]).await?;
        self.run(entrypoint, env, &["destroy", "-auto-approve"])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_runner(dir: &Path, script: &str) -> TerraformCli {
        // a stand-in "terraform" that records its argv and exits per script
        let binary = dir.join("terraform");
        std::fs::write(&binary, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        TerraformCli::new(binary)
    }

    #[tokio::test]
    async fn apply_runs_init_then_apply() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(dir.path(), r#"echo "$1" >> invocations.txt"#);

        runner
            .init_apply_auto_approve(dir.path(), &BTreeMap::new())
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("invocations.txt")).unwrap();
        assert_eq!(log, "init\napply\n");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(
            dir.path(),
            r#"if [ "$1" = "apply" ]; then echo "Error acquiring the state lock" >&2; exit 1; fi"#,
        );

        let err = runner
            .init_apply_auto_approve(dir.path(), &BTreeMap::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("terraform error"), "{message}");
        assert!(message.contains("state lock"), "{message}");
    }

    #[tokio::test]
    async fn injected_env_reaches_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(dir.path(), r#"echo "$TF_VAR_civo_token" >> env.txt"#);

        let mut env = BTreeMap::new();
        env.insert("TF_VAR_civo_token".to_string(), "civo-123".to_string());
        runner
            .init_destroy_auto_approve(dir.path(), &env)
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert!(log.contains("civo-123"));
    }
}
