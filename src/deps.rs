//! System dependency checks and SNX client installation

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

pub const INSTALL_SCRIPT: &str = "snx_install_linux30.sh";

#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Installation script not found at {0}")]
    ScriptMissing(PathBuf),
    #[error("Elevation helper '{0}' not found")]
    HelperMissing(String),
    #[error("Installation failed or was cancelled: {0}")]
    InstallFailed(String),
}

/// Presence report for the external binaries this tool drives. Absence is a
/// state, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependencies {
    pub client_installed: bool,
    pub elevation_helper_installed: bool,
}

/// Check that the SNX client and the elevation helper are on PATH.
pub fn check(client_bin: &str, helper_bin: &str) -> Dependencies {
    Dependencies {
        client_installed: binary_available(client_bin),
        elevation_helper_installed: binary_available(helper_bin),
    }
}

fn binary_available(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Default location of the bundled install script: `bin/` beside the
/// executable.
pub fn default_install_script() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("bin").join(INSTALL_SCRIPT))
}

/// Run the SNX install script under elevation.
pub async fn install_client(helper: &str, script: &Path) -> Result<String, DependencyError> {
    if !script.exists() {
        return Err(DependencyError::ScriptMissing(script.to_path_buf()));
    }
    info!("Installing SNX client via {}", script.display());

    let output = Command::new(helper)
        .arg("sh")
        .arg(script)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DependencyError::HelperMissing(helper.to_string()),
            _ => DependencyError::InstallFailed(e.to_string()),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DependencyError::InstallFailed(stderr));
    }
    info!("SNX installation script finished successfully");
    Ok("Installation successful".to_string())
}
