//! Privileged command execution
//!
//! Route mutations need root, and each elevation helper invocation may pop a
//! dialog at the user. All commands of one logical operation are therefore
//! joined into a single shell script and piped through one helper run. No
//! timeout is imposed: the elevation dialog may legitimately wait on the user
//! indefinitely.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ElevateError {
    #[error("Elevation helper '{0}' not found")]
    HelperMissing(String),
    #[error("Failed to run elevation helper: {0}")]
    Io(#[from] std::io::Error),
    #[error("Privileged command failed: {0}")]
    CommandFailed(String),
}

pub struct PrivilegedRunner {
    helper: String,
    shell: String,
}

impl Default for PrivilegedRunner {
    fn default() -> Self {
        Self::new("pkexec", "bash")
    }
}

impl PrivilegedRunner {
    pub fn new(helper: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
            shell: shell.into(),
        }
    }

    pub fn helper(&self) -> &str {
        &self.helper
    }

    /// Run a batch of shell commands as one elevated script.
    ///
    /// The batch either runs under a single helper invocation or fails as a
    /// whole; a non-zero exit surfaces the helper's stderr.
    pub async fn run_batch(&self, commands: &[String]) -> Result<(), ElevateError> {
        if commands.is_empty() {
            return Ok(());
        }
        let script = commands.join("\n");
        info!("Running {} privileged command(s) via {}", commands.len(), self.helper);
        debug!("Privileged script:\n{}", script);

        let mut child = Command::new(&self.helper)
            .arg(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ElevateError::HelperMissing(self.helper.clone()),
                _ => ElevateError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ElevateError::CommandFailed(stderr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    // Stand-in helper that appends its stdin to a file, so tests can assert
    // exactly what would have run under elevation.
    fn recording_runner(dir: &std::path::Path) -> (PrivilegedRunner, std::path::PathBuf) {
        let log = dir.join("commands.log");
        let helper = dir.join("fake-helper");
        std::fs::write(
            &helper,
            format!("#!/bin/sh\ncat >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        (
            PrivilegedRunner::new(helper.to_string_lossy().into_owned(), "bash"),
            log,
        )
    }

    #[tokio::test]
    async fn batch_is_piped_as_one_script() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner(dir.path());
        let commands = vec![
            "ip route add 192.0.2.10 via 10.10.5.7".to_string(),
            "ip route add 192.0.2.11 via 10.10.5.7".to_string(),
        ];
        runner.run_batch(&commands).await.unwrap();
        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(recorded, commands.join("\n") + "\n");
    }

    #[tokio::test]
    async fn empty_batch_never_invokes_the_helper() {
        let runner = PrivilegedRunner::new("/nonexistent/helper", "bash");
        runner.run_batch(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn missing_helper_is_reported_as_such() {
        let runner = PrivilegedRunner::new("/nonexistent/helper", "bash");
        let err = runner
            .run_batch(&["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ElevateError::HelperMissing(_)));
    }

    #[tokio::test]
    async fn failing_batch_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("failing-helper");
        std::fs::write(&helper, "#!/bin/sh\necho 'permission denied' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        let runner = PrivilegedRunner::new(helper.to_string_lossy().into_owned(), "bash");

        let err = runner.run_batch(&["true".to_string()]).await.unwrap_err();
        match err {
            ElevateError::CommandFailed(stderr) => assert_eq!(stderr, "permission denied"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
