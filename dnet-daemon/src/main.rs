// DungeonNet daemon: advertises and browses on the LAN, connects Primary and Secondary
// peers, and runs or mirrors the encounter's initiative order.

mod config;
mod discovery;
mod logging;
mod node;
mod session;
mod tcp;

use std::path::PathBuf;

use clap::Parser;
use dnet_core::PeerRole;

/// DungeonNet peer for the table.
#[derive(Parser)]
#[command(name = "dungeonnet", version)]
struct Cli {
    /// primary (dungeon master) or secondary (initiative order display)
    #[arg(long, default_value = "primary")]
    role: PeerRole,

    /// Config file, instead of the default locations
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name to advertise, before the host name
    #[arg(long)]
    name: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        cfg.name = Some(name);
    }
    logging::init_logging(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(node::run(cfg, cli.role, shutdown_signal()))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
