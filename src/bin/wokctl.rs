// src/bin/wokctl.rs - control client for a running wokfs host
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use wokfs_rs::control::ControlClient;

#[derive(Parser)]
#[command(name = "wokctl", about = "Inspect and modify a live wokfs module stack", version = "0.1.0")]
struct Cli {
    /// Control socket of the wokfs host
    #[arg(short = 'S', long, value_name = "PATH", default_value = "/var/run/wokfs.sock")]
    socket: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a module and insert it at POSITION (0 is outermost)
    Insert {
        #[arg(allow_negative_numbers = true)]
        position: i32,
        path: String,
    },
    /// Show the module stack
    List,
    /// Reload the module at POSITION from its original path
    Reload {
        #[arg(allow_negative_numbers = true)]
        position: i32,
    },
    /// Remove the module at POSITION
    Remove {
        #[arg(allow_negative_numbers = true)]
        position: i32,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("wokctl: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ControlClient::connect(&cli.socket)
        .await
        .map_err(|e| format!("{}: {}", cli.socket.display(), e))?;
    match cli.command {
        Command::Insert { position, path } => client.insert(position, &path).await?,
        Command::Reload { position } => client.reload(position).await?,
        Command::Remove { position } => client.remove(position).await?,
        Command::List => {
            let entries = client.list().await?;
            println!("{:>4}  {:<25}  {}", "POS", "LOADED", "PATH");
            for entry in entries {
                let loaded = match (entry.vacant, entry.loaded_at) {
                    (true, _) => "<vacant>".to_string(),
                    (false, Some(at)) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    (false, None) => "-".to_string(),
                };
                println!("{:>4}  {:<25}  {}", entry.position, loaded, entry.path);
            }
        }
    }
    Ok(())
}
