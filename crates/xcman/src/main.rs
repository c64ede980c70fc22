mod cache;
mod cli;
mod commands;
mod error;
mod logging;
mod settings;
mod single_instance;

use std::process::ExitCode;

use clap::Parser;
use xcman_core::CheckInterval;
use xcman_platform::AppPaths;

use crate::cli::{Cli, Commands};
use crate::commands::App;
use crate::error::AppError;
use crate::settings::AppSettings;
use crate::single_instance::SingleInstance;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error}");
            eprintln!("xcman: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let paths = match &cli.root {
        Some(root) => AppPaths::rooted_at(root),
        None => AppPaths::new()?,
    };
    paths
        .ensure_dirs()
        .map_err(|error| AppError::io("failed to create application directories", error))?;

    let settings = AppSettings::load(&paths);
    if !paths.settings_file().exists()
        && let Err(error) = settings.save(&paths)
    {
        log::warn!("Could not write default settings: {error}");
    }
    logging::init_logging(
        &paths,
        cli.verbose || settings.debug_logging,
        settings.max_log_size_bytes,
    );
    log::debug!("Running {:?}", cli.command);

    let _instance = if cli.command.needs_instance_lock() {
        Some(SingleInstance::acquire(&paths.lock_file())?)
    } else {
        None
    };
    let app = App::new(paths, settings)?;

    match cli.command {
        Commands::Check => app.check().await,
        Commands::Status => app.status(),
        Commands::Select { package, off } => app.select(&package, !off),
        Commands::Upgrade { packages } => app.upgrade(&packages).await,
        Commands::Schedule {
            days,
            hours,
            minutes,
        } => app.schedule(CheckInterval::new(days, hours, minutes)),
        Commands::Disable => app.disable(),
        Commands::Model { name, clear } => app.model(name.as_deref(), clear).await,
        Commands::Tick => app.tick().await,
        Commands::Watch => app.watch(true).await,
        Commands::Boot => app.watch(false).await,
    }
}
