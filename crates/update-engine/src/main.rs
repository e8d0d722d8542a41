//! update-engine CLI entry point
//!
//! Runs one update attempt against the configured feed and reports the
//! lifecycle events on stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use semver::Version;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use update_engine::{
    AttemptOutcome, BaseArtifactSource, CommandInstaller, ControllerDeps, EngineConfig,
    FileBaseSource, HttpTransport, InstallationIdentity, InstallerInvoker, Jitter, NoJitter,
    RandJitter, SystemClock, UpdateController, UpdateError, UpdateEvent,
};

#[derive(Debug, Parser)]
#[command(name = "update-engine", version, about = "Check for, download and install verified updates")]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "UPDATE_ENGINE_CONFIG")]
    config: PathBuf,

    /// Version of the installed application
    #[arg(long)]
    current_version: Version,

    /// Accept optional updates without asking
    #[arg(short, long)]
    yes: bool,

    /// Install as soon as the update is ready
    #[arg(long)]
    install: bool,

    /// Info-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Debug-level logging
    #[arg(long)]
    debug: bool,
}

/// Stands in when `install.command` is empty, so checks and downloads still work.
struct Unconfigured;

#[async_trait]
impl InstallerInvoker for Unconfigured {
    async fn install_and_restart(&self, _: &Path, _: bool, _: bool) -> Result<(), UpdateError> {
        Err(UpdateError::Config("install.command is not configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = EngineConfig::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let jitter: Arc<dyn Jitter> = if config.network.jitter {
        Arc::new(RandJitter)
    } else {
        Arc::new(NoJitter)
    };
    let base_source = config
        .install
        .base_artifact
        .clone()
        .map(|path| Arc::new(FileBaseSource::new(path)) as Arc<dyn BaseArtifactSource>);
    let installer: Arc<dyn InstallerInvoker> = if config.install.command.is_empty() {
        Arc::new(Unconfigured)
    } else {
        Arc::new(CommandInstaller::from_command_line(&config.install.command)?)
    };

    let deps = ControllerDeps {
        transport: Arc::new(HttpTransport::new(config.feed.fetch_timeout())?),
        installer,
        clock: Arc::new(SystemClock),
        jitter,
        base_source,
        identity: InstallationIdentity::load_or_create(&config.identity_path())?,
    };

    let (controller, mut events) = UpdateController::new(&config, cli.current_version, deps)?;

    let answer = cli.yes;
    let prompt = controller.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                UpdateEvent::UpdateAvailable(summary) => {
                    println!("{}: {} ({} bytes)", event.name(), summary.version, summary.size);
                    if !summary.release_notes.is_empty() {
                        println!("  {}", summary.release_notes);
                    }
                    match prompt.user_consent(answer) {
                        Ok(()) | Err(UpdateError::InvalidState(_)) => {}
                        Err(e) => warn!(error = %e, "Failed to answer consent prompt"),
                    }
                }
                UpdateEvent::DownloadProgress(progress) => println!("{}: {}", event.name(), progress),
                UpdateEvent::Error { kind, message } => {
                    eprintln!("{} [{}]: {}", event.name(), kind, message)
                }
                _ => println!("{}", event.name()),
            }
        }
    });

    let outcome = controller.check_for_updates().await;
    let result = match outcome {
        Ok(AttemptOutcome::ReadyToInstall(summary)) if cli.install => {
            println!("installing {}", summary.version);
            controller.install_now().await.map_err(anyhow::Error::from)
        }
        Ok(AttemptOutcome::ReadyToInstall(summary)) => {
            if controller.on_quit().await? {
                println!("installed {} on exit", summary.version);
            } else {
                println!("{} is ready; rerun with --install to apply it", summary.version);
            }
            Ok(())
        }
        Ok(AttemptOutcome::NotAdmitted(decision)) => {
            println!("not yet offered to this installation (bucket {})", decision.bucket_value);
            Ok(())
        }
        Ok(AttemptOutcome::UpToDate) => {
            println!("{} is up to date", controller.current_version());
            Ok(())
        }
        Ok(AttemptOutcome::Declined) => {
            println!("update declined; rerun with --yes to accept it");
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    printer.abort();
    result
}
