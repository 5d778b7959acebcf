use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dtf_client::{ClientConfig, DeviceClient, SocketAddress};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dtf")]
#[command(about = "Controller for the dtf device agent", version)]
struct Args {
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Agent socket, `@name` for the abstract namespace
    #[arg(short, long)]
    socket: Option<String>,

    /// Per-connection read/write timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from the device
    Pull {
        /// Path on the device
        remote: String,
        /// Local destination
        local: PathBuf,
    },
    /// Upload a file to the device
    Push {
        /// Local source
        local: PathBuf,
        /// Path on the device, must not exist yet
        remote: String,
    },
    /// Run a shell command on the device
    Exec {
        /// Command line, joined with spaces
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::new()
        .with_timeout(args.timeout.filter(|secs| *secs > 0).map(Duration::from_secs));
    if let Some(socket) = args.socket {
        config = config.with_address(SocketAddress::parse(&socket));
    }
    let client = DeviceClient::new(config);
    info!("Using agent at {}", client.address());

    match args.command {
        Commands::Pull { remote, local } => {
            let transfer = client
                .download(&remote, &local)
                .with_context(|| format!("Failed to pull {remote}"))?;
            println!("{} -> {}: {} bytes", remote, local.display(), transfer.bytes);
            println!("sha256 {}", transfer.sha256);
        }

        Commands::Push { local, remote } => {
            let transfer = client
                .upload(&local, &remote)
                .with_context(|| format!("Failed to push {}", local.display()))?;
            println!("{} -> {}: {} bytes", local.display(), remote, transfer.bytes);
            println!("sha256 {}", transfer.sha256);
        }

        Commands::Exec { command } => {
            let command = command.join(" ");
            let output = client
                .execute(&command)
                .with_context(|| format!("Failed to execute {command:?}"))?;
            print!("{output}");
        }
    }

    Ok(())
}
