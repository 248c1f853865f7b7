//! xdix - X extension request core
//!
//! Serves DRI2, XvMC, Composite, XFIXES regions and XFree86-DRI over a
//! framed socket protocol, with one task owning all server state.

mod completion;
mod composite;
mod config;
mod dix;
mod dri2;
mod listener;
mod panoramix;
mod server;
mod xf86dri;
mod xfixes;
mod xvmc;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::completion::CompletionQueue;
use crate::config::Config;
use crate::dri2::VirtualCrtc;
use crate::server::{Backends, Server};

/// `--config <path>` is the only flag
fn config_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => match args.next() {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => bail!("--config needs a path"),
        },
        Some(other) => bail!("Unknown argument: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xdix=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting xdix");

    let config = Config::load(config_arg()?.as_deref())?;

    let completions = CompletionQueue::new();
    let crtc = VirtualCrtc::new(&config.screens, completions.sender());
    let vblank_tasks = crtc.spawn();
    let backends = Backends {
        dri2: Some(Box::new(crtc)),
        xvmc: None,
    };
    let server = Server::new(&config, backends, completions).context("Failed to start server")?;

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let socket_path = config.server.socket_path();
    let unix = listener::listen_unix(&socket_path, inbound_tx.clone())?;
    let tcp = match &config.server.tcp_listen {
        Some(addr) => Some(listener::listen_tcp(addr, inbound_tx.clone()).await?),
        None => None,
    };
    drop(inbound_tx);

    // SIGTERM/SIGINT → orderly shutdown
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = shutdown_tx.send(()).await;
    });

    server.run(inbound_rx, shutdown_rx).await;

    unix.abort();
    if let Some(tcp) = tcp {
        tcp.abort();
    }
    for task in vblank_tasks {
        task.abort();
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        error!("Failed to remove socket {:?}: {}", socket_path, e);
    }

    info!("xdix stopped");
    Ok(())
}
