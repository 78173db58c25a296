use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CredentialError, Result};

/// Exit code and captured stdout of one plugin run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutput {
    pub exit_code: i32,
    pub stdout: String,
}

impl PluginOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
        }
    }
}

/// Runs a legacy plugin executable to completion.
#[async_trait]
pub trait PluginProcessRunner: Send + Sync {
    async fn run(
        &self,
        path: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PluginOutput>;
}

/// Runs plugins as child processes. The child is killed when the run is
/// abandoned through timeout or cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl PluginProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        path: &Path,
        args: &[String],
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<PluginOutput> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn()?;
        let output = tokio::select! {
            result = timeout(limit, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => return Err(CredentialError::Timeout(limit)),
            },
            _ = cancel.cancelled() => return Err(CredentialError::Cancelled),
        };

        if !output.stderr.is_empty() {
            debug!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "Credential plugin wrote to stderr"
            );
        }

        Ok(PluginOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
