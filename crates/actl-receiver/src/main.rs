//! actl-receiver - control-channel receiver daemon for agent-ctl

use agent_ctl_receiver::audit::{AuditHandle, JsonlSink};
use agent_ctl_receiver::authz::TeamRoster;
use agent_ctl_receiver::config::ReceiverConfig;
use agent_ctl_receiver::adapter::SpoolAdapter;
use agent_ctl_receiver::dispatch::ControlReceiver;
use agent_ctl_receiver::liveness::StaticRegistry;
use agent_ctl_receiver::socket::start_socket_server;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Control-channel receiver: idempotent, liveness-gated stdin/interrupt
/// delivery for live agent sessions.
#[derive(Parser, Debug)]
#[command(name = "actl-receiver")]
#[command(about = "Control-channel receiver for agent-ctl")]
#[command(version)]
struct Args {
    /// Path to the team roster file (default: ${ACTL_HOME}/.actl/roster.toml)
    #[arg(long, value_name = "PATH")]
    roster: Option<PathBuf>,

    /// Directory for spooled worker input (default: ${ACTL_HOME}/.actl/spool)
    #[arg(long, value_name = "PATH")]
    spool_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    agent_ctl_core::logging::init_with_level(args.verbose.then_some(tracing::Level::DEBUG));

    info!("actl-receiver starting...");

    let home_dir =
        agent_ctl_core::home::get_home_dir().context("Failed to determine home directory")?;
    let control_dir = home_dir.join(".actl");

    let config = ReceiverConfig::from_env();
    info!(
        "Dedup TTL {:?}, capacity {}, hard limit {} bytes",
        config.dedup_ttl, config.dedup_capacity, config.hard_limit_bytes
    );

    let roster_path = args.roster.unwrap_or_else(|| control_dir.join("roster.toml"));
    let roster = if roster_path.exists() {
        let roster = TeamRoster::load(&roster_path)?;
        info!(
            "Loaded roster from {} ({} team(s))",
            roster_path.display(),
            roster.team_count()
        );
        roster
    } else {
        warn!(
            "No roster at {}; all control requests will be rejected",
            roster_path.display()
        );
        TeamRoster::new()
    };

    let spool_dir = args.spool_dir.unwrap_or_else(|| control_dir.join("spool"));
    let adapter = SpoolAdapter::new(&spool_dir);
    info!("Spooling worker input under {}", spool_dir.display());

    let sink = JsonlSink::from_env().context("Failed to resolve audit sink path")?;
    info!("Audit trail at {}", sink.path().display());
    let (audit, _audit_task) = AuditHandle::spawn(Arc::new(sink), &config);

    let registry = StaticRegistry::new();
    let receiver = Arc::new(ControlReceiver::new(
        config,
        Arc::new(registry.clone()),
        Arc::new(adapter),
        Arc::new(roster),
        audit,
    ));

    let cancel = CancellationToken::new();
    let sweeper = receiver.spawn_sweeper(cancel.clone());

    let handle = start_socket_server(home_dir, Arc::clone(&receiver), registry, cancel.clone())
        .await
        .context("Failed to start socket server")?;
    if handle.is_none() {
        anyhow::bail!("socket server is not supported on this platform");
    }

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    cancel.cancel();
    let _ = sweeper.await;
    drop(handle);

    info!("actl-receiver stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
