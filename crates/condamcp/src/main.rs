mod cli;
mod config;
mod logging;
mod mcp;
mod tools;

use anyhow::Context;
use clap::Parser;
use cli::Args;
use config::{load_config, resolve_settings};
use engine::locate::Discovery;
use engine::Engine;
use mcp::CondaHandler;
use protocol::config::ServerConfig;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    let settings = resolve_settings(config, &args, Discovery::from_env(None))?;
    let file_dir = settings.log_dir.as_deref().filter(|_| settings.log_to_file);
    let _log_guard = logging::init_tracing(file_dir)?;

    if settings.conda_found {
        tracing::info!(program = %settings.engine.program.display(), "using conda executable");
    } else {
        tracing::warn!("conda executable not found; requests will fail until it is installed");
    }

    let engine = Engine::new(settings.engine).context("invalid engine configuration")?;
    let registry = engine.registry().clone();
    let shutdown = CancellationToken::new();
    let reaper = registry.spawn_reaper(settings.reap_interval, shutdown.clone());

    let handler = CondaHandler::new(engine, tools::all_tools());
    let service = handler
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await
        .context("failed to start MCP server")?;
    tracing::info!(event = "server.started", "serving MCP over stdio");

    let result = tokio::select! {
        result = service.waiting() => result.map(|reason| {
            tracing::info!(event = "server.stopped", reason = ?reason, "client disconnected");
        }).context("MCP service failed"),
        _ = shutdown_signal() => {
            tracing::info!(event = "server.stopped", "received shutdown signal");
            Ok(())
        }
    };

    shutdown.cancel();
    registry.shutdown().await;
    if let Err(err) = reaper.await {
        tracing::warn!(error = %err, "reaper task failed");
    }
    result
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
