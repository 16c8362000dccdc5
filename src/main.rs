mod cipher;
mod cli;
mod config;
mod conn;
mod dns;
mod error;
mod listener;
mod request;
mod server;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::{error, info};

use cli::Cli;
use config::Config;
use error::Error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.print().ok();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(error::exit_code::USAGE as u8);
        }
    };

    if let Err(e) = telemetry::init_telemetry() {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::from(error::exit_code::USAGE as u8);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "iodns exiting");
            let code = e.exit_code().unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    info!("loading configuration from {}", cli.config.display());
    let config = Config::load(&cli.config)?;

    let bind_addr = config.local_bind_addr().await?;
    let registry = config.resolve_registry().await?;
    info!(servers = registry.len(), "resolved ioserver registry");

    drop_privileges(&config)?;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let config = Arc::new(config);
    let registry = Arc::new(registry);

    let listener_task = {
        let config = config.clone();
        let registry = registry.clone();
        tokio::spawn(async move { listener::run(config, registry, bind_addr, cancel_rx).await })
    };

    shutdown_signal().await;
    let _ = cancel_tx.send(true);

    match listener_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(join_err) => Err(Error::Oom(format!("listener task panicked: {join_err}"))),
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, whichever arrives first.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("received SIGINT, shutting down"),
                Err(e) => error!(error = %e, "failed to listen for SIGINT"),
            }
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

/// Drop from root to the configured unprivileged user/group, if any is set.
/// Group must be dropped before user, while still root.
fn drop_privileges(config: &Config) -> Result<(), Error> {
    if let Some(group) = &config.group {
        let g = nix::unistd::Group::from_name(group)
            .map_err(|e| Error::ConfigInvalid(format!("group lookup failed: {e}")))?
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown group: {group}")))?;
        nix::unistd::setgid(g.gid)
            .map_err(|e| Error::ConfigInvalid(format!("setgid failed: {e}")))?;
    }

    if let Some(user) = &config.user {
        let u = nix::unistd::User::from_name(user)
            .map_err(|e| Error::ConfigInvalid(format!("user lookup failed: {e}")))?
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown user: {user}")))?;
        nix::unistd::setuid(u.uid)
            .map_err(|e| Error::ConfigInvalid(format!("setuid failed: {e}")))?;
    }

    Ok(())
}
