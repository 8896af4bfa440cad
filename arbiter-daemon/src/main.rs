// SPDX-License-Identifier: GPL-3.0-only

//! Disk Arbiter - D-Bus daemon for disk arbitration
//!
//! Tracks attached disks, probes them against filesystem personalities,
//! and arbitrates mount/unmount/eject/rename requests with Polkit-based
//! authorization and client approval rounds.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};
use zbus::connection::Builder as ConnectionBuilder;

mod auth;
mod dbus;

use arbiter_core::{ArbitrationHandle, CallbackSpec, CallerIdentity, EngineConfig, PersonalityRegistry};
use arbiter_types::CallbackKind;
use auth::PolkitAuthorizer;
use dbus::ArbiterInterface;

#[derive(Debug, Parser)]
#[command(name = "disk-arbiterd", about = "Disk arbitration daemon", version)]
struct Args {
    /// Directory holding filesystem personality definitions.
    #[arg(long, default_value = "/usr/lib/disk-arbiter/filesystems")]
    personality_dir: PathBuf,

    /// Directory auto-mount targets are created under.
    #[arg(long, default_value = "/media")]
    mount_root: PathBuf,

    /// Group whose members may operate on disks without Polkit checks.
    #[arg(long, default_value = "wheel")]
    admin_group: String,

    /// Stage a mount for removable media as soon as probing succeeds.
    #[arg(long)]
    auto_mount: bool,

    /// Authorize sessions that connected without presenting rights.
    #[arg(long)]
    allow_unauthenticated_sessions: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to journald/stderr
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("arbiter_daemon=info,arbiter_core=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Disk Arbiter v{}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Disk arbiter must run as root");
        anyhow::bail!("Daemon must run with root privileges");
    }

    let personalities = PersonalityRegistry::load(&args.personality_dir)?;
    tracing::info!(
        "Loaded {} filesystem personalities from {}",
        personalities.len(),
        args.personality_dir.display()
    );

    // Authorization checks run on their own bus connection so they never
    // contend with the serving connection.
    let polkit_connection = zbus::Connection::system().await?;
    let authorizer = Arc::new(PolkitAuthorizer::new(polkit_connection));

    let config = EngineConfig {
        admin_group: args.admin_group,
        allow_sessions_without_rights: args.allow_unauthenticated_sessions,
        auto_mount: args.auto_mount,
        mount_root: args.mount_root,
    };
    let engine = ArbitrationHandle::spawn(config, personalities, authorizer);

    // Observer session that turns engine events into bus signals.
    let daemon_identity = CallerIdentity {
        uid: 0,
        gid: 0,
        pid: std::process::id(),
    };
    let observer = engine.connect(daemon_identity, true).await?;
    for kind in [
        CallbackKind::DiskAppeared,
        CallbackKind::DiskDisappeared,
        CallbackKind::DiskDescriptionChanged,
    ] {
        observer.register_callback(CallbackSpec::for_kind(kind)).await?;
    }

    let connection = ConnectionBuilder::system()?
        .name(dbus::SERVICE_NAME)?
        .serve_at(dbus::OBJECT_PATH, ArbiterInterface::new(engine))?
        .build()
        .await?;

    tracing::info!("Daemon registered on D-Bus system bus");
    tracing::info!("  - {} at {}", dbus::SERVICE_NAME, dbus::OBJECT_PATH);

    tokio::spawn(async move {
        if let Err(error) = dbus::emit_disk_events(connection, observer).await {
            tracing::error!("disk event forwarding stopped: {error}");
        }
    });

    tracing::info!("Daemon ready, waiting for requests...");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down disk arbiter");
    Ok(())
}
