use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use dtf_common::SocketAddress;
use dtf_server::{logging, ServerConfig, Supervisor, Trigger};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dtf-server")]
#[command(about = "dtf on-device agent", version)]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket to listen on, `@name` for the abstract namespace
    #[arg(short, long)]
    socket: Option<String>,

    /// Shell used to run execute requests
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Additionally trust this uid (repeatable)
    #[arg(long = "trust-uid")]
    trust_uids: Vec<u32>,

    /// Per-connection read/write timeout in seconds, 0 disables it
    #[arg(long)]
    io_timeout: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(&args.log_level);

    info!("Starting dtf agent...");
    #[cfg(unix)]
    {
        if nix::unistd::getuid().is_root() {
            info!("Agent running with root privileges");
        } else {
            warn!("Agent not running as root - some operations may fail");
        }
    }

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        config = config.with_address(SocketAddress::parse(&socket));
    }
    if let Some(shell) = args.shell {
        config = config.with_shell(shell);
    }
    if let Some(secs) = args.io_timeout {
        config = config.with_io_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    for uid in args.trust_uids {
        config.policy = config.policy.trust_uid(uid);
    }

    let (triggers, receiver) = crossbeam_channel::unbounded();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping agent...");
        let _ = triggers.send(Trigger::Shutdown);
    })
    .context("Failed to set signal handler")?;

    let mut supervisor = Supervisor::new(config);
    supervisor.start().context("Failed to start agent")?;
    supervisor.run(receiver).context("Agent error")?;

    info!("Agent shut down");
    Ok(())
}
