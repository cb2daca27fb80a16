use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskmesh::app::Application;
use taskmesh::shutdown::ShutdownManager;
use taskmesh_config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("taskmesh")
        .version("1.0.0")
        .about("Distributed task orchestration node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Node identity (defaults to hostname plus a random suffix)"),
        )
        .arg(
            Arg::new("max-concurrent")
                .long("max-concurrent")
                .value_name("N")
                .help("Override the worker pool concurrency limit")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let node_id = matches.get_one::<String>("node-id");
    let max_concurrent = matches.get_one::<usize>("max-concurrent");
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    init_logging(log_level, log_format)?;

    info!("starting taskmesh node");
    if let Some(path) = config_path {
        info!("configuration file: {path}");
    }

    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("failed to load configuration")?;
    if let Some(id) = node_id {
        config.node_id = Some(id.clone());
    }
    if let Some(&limit) = max_concurrent {
        config.worker.max_concurrent = limit;
    }

    let app = Application::build(config).await?;
    let node_id = app.node_id().to_string();

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run_until_shutdown(shutdown_rx).await {
                error!("node run failed: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!(node_id = %node_id, "shutdown signal received");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("node task failed during shutdown: {e}");
            } else {
                info!("node stopped cleanly");
            }
        }
        Err(_) => {
            warn!("node did not stop within 30s, exiting anyway");
        }
    }

    info!("taskmesh node exited");
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("failed to install json log subscriber")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("failed to install pretty log subscriber")?;
        }
        _ => {
            return Err(anyhow::anyhow!("unsupported log format: {log_format}"));
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        },
        _ = terminate => {
            info!("received SIGTERM");
        },
    }
}
