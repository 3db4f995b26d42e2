// src/main.rs - wokfs host: module stack plus its control socket
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use wokfs_rs::config::{self, Config};
use wokfs_rs::control::{ControlProtocol, ControlServer};
use wokfs_rs::module::DylibLoader;
use wokfs_rs::stack::ModuleStack;

#[derive(Parser)]
#[command(name = "wokfs-host", about = "Live filesystem module stack", version = "0.1.0")]
struct Cli {
    /// Configuration file; built-in defaults are used when omitted
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<String>,
    /// Control socket path, overriding the configuration
    #[arg(short = 'S', long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Log level, overriding the configuration
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => config::load_config(path).map_err(|e| {
            eprintln!("Failed to load config from '{}': {}", path, e);
            Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
        })?,
        None => Config::default(),
    };
    if let Some(socket) = cli.socket {
        config.control.socket_path = socket;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(config.logging.tracing_level()?)
        .init();

    tracing::info!("Starting wokfs host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Reload strategy: {:?}", config.modules.reload_strategy);
    if let Some(ms) = config.modules.load_timeout_ms {
        tracing::info!("Module load timeout: {} ms", ms);
    }

    let stack = ModuleStack::new(Arc::new(DylibLoader::new()), config.modules.stack_options());
    for (position, module) in config.modules.preload.iter().enumerate() {
        let position = i32::try_from(position)?;
        if let Err(e) = stack.insert(position, &module.path).await {
            tracing::error!("Failed to preload {}: {}", module.path.display(), e);
            stack.clear().await;
            return Err(e.into());
        }
    }
    tracing::info!("{} module(s) preloaded", stack.len().await);

    let protocol = Arc::new(
        ControlProtocol::new(stack.clone(), config.control.privileged_uid)
            .with_send_timeout(config.control.send_timeout()),
    );
    let server = ControlServer::bind(&config.control, protocol)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down wokfs host");
    let _ = shutdown_tx.send(());
    server_task.await??;

    stack.clear().await;
    Ok(())
}
