// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! The `chartly-drone` binary.
//!
//! Configuration comes from the environment (`CONTROL_PLANE` is required);
//! exit code 1 on missing configuration or registration failure, 0 on
//! graceful shutdown.

use anyhow::{Context, Result};
use chartly_drone::{Drone, DroneConfig, shutdown_pair};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chartly-drone", version, about = "Chartly edge worker")]
struct Args {
    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,

    /// Run a single iteration and exit (for smoke runs and cron).
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("chartly=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chartly=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DroneConfig::from_env().context("load drone configuration")?;
    info!(
        drone_id = %config.drone_id,
        control_plane = %config.control_plane,
        "starting drone"
    );

    let (handle, shutdown) = shutdown_pair();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        handle.shutdown();
    });

    let mut drone = Drone::new(config)?;
    drone
        .register(&shutdown)
        .await
        .context("register with control plane")?;
    drone.run(&shutdown, args.once).await?;

    info!("drone stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
