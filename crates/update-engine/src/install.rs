//! Installer invocation.
//!
//! The engine hands a verified, staged artifact to an [`InstallerInvoker`]
//! exactly once per attempt, after it reached `ReadyToInstall`. What happens
//! next (silent install, relaunch) is platform territory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::UpdateError;

/// Installs a staged artifact and restarts the application.
#[async_trait]
pub trait InstallerInvoker: Send + Sync {
    async fn install_and_restart(
        &self,
        artifact: &Path,
        is_silent: bool,
        force_restart: bool,
    ) -> Result<(), UpdateError>;
}

/// Runs an external installer program.
///
/// Invoked as `program [args..] [silent_flag] [restart_flag] <artifact>`.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: PathBuf,
    args: Vec<String>,
    silent_flag: String,
    restart_flag: String,
}

impl CommandInstaller {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            silent_flag: "--silent".to_string(),
            restart_flag: "--force-restart".to_string(),
        }
    }

    /// Build from a command line, program first.
    pub fn from_command_line(command: &[String]) -> Result<Self, UpdateError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| UpdateError::Config("install.command is empty".to_string()))?;
        Ok(Self::new(program, args.to_vec()))
    }

    pub fn with_flags(mut self, silent_flag: String, restart_flag: String) -> Self {
        self.silent_flag = silent_flag;
        self.restart_flag = restart_flag;
        self
    }

    fn command(&self, artifact: &Path, is_silent: bool, force_restart: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if is_silent {
            cmd.arg(&self.silent_flag);
        }
        if force_restart {
            cmd.arg(&self.restart_flag);
        }
        cmd.arg(artifact);
        cmd
    }
}

#[async_trait]
impl InstallerInvoker for CommandInstaller {
    async fn install_and_restart(
        &self,
        artifact: &Path,
        is_silent: bool,
        force_restart: bool,
    ) -> Result<(), UpdateError> {
        info!(
            program = %self.program.display(),
            artifact = %artifact.display(),
            is_silent,
            force_restart,
            "Invoking installer"
        );

        let output = self
            .command(artifact, is_silent, force_restart)
            .output()
            .await
            .map_err(|e| UpdateError::Installer(format!("failed to start installer: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::Installer(format!(
                "installer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        debug!("Installer finished");
        Ok(())
    }
}
