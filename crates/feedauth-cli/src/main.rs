mod cli;
mod commands;
mod logging;
mod output;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use feedauth_core::FeedAuthSettings;
use feedauth_plugins::{
    AcceptAllVerifier, PluginFlavor, ProcessLauncher, SharedPluginManager, SystemEnvironment,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref());
    if cli.non_interactive {
        settings.non_interactive = true;
    }

    let _guard = logging::init(cli.verbose, settings.log_dir.as_deref())?;
    debug!(
        config = ?cli.config,
        non_interactive = settings.non_interactive,
        "Settings loaded"
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Get(args) => {
            let manager = plugin_manager(&settings);
            let result = commands::get::run(args, settings, manager.clone(), cli.format, &cancel).await;
            manager.shutdown();
            result
        }
        Commands::Plugins => {
            let manager = plugin_manager(&settings);
            commands::plugins::run(&settings, manager, cli.format, &cancel).await
        }
        Commands::Config { command } => {
            commands::config::run(command, &settings, cli.config.as_deref(), cli.format)
        }
    }
}

/// Unreadable settings fall back to the defaults with a warning.
fn load_settings(path: Option<&Path>) -> FeedAuthSettings {
    match FeedAuthSettings::load(path) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Warning: Failed to load settings: {err}");
            FeedAuthSettings::default()
        }
    }
}

fn plugin_manager(settings: &FeedAuthSettings) -> Arc<SharedPluginManager> {
    let config = settings.plugin_manager_config(&SystemEnvironment, PluginFlavor::Core);
    Arc::new(SharedPluginManager::new(
        config,
        Arc::new(ProcessLauncher),
        Arc::new(AcceptAllVerifier),
    ))
}
