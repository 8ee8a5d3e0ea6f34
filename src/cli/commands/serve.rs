//! Serve command - run the recovery core behind a line-oriented adapter.
//!
//! Transport events arrive as JSON lines on stdin; outbound events leave as
//! JSON lines on stdout. Logs go to stderr.

use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::session::{ChannelTransport, RecoveryCoordinator, TransportEvent};
use crate::telemetry;
use crate::time::SystemClock;
use anyhow::{Context, Result};
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    env::set_var("TETHER_CONFIG", args.config.display().to_string());
    let config = Config::load_from_env()?;
    config.validate().context("invalid configuration")?;
    let _log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;

    let (transport, mut outbound) = ChannelTransport::new(args.buffer);
    let coordinator = Arc::new(RecoveryCoordinator::new(
        config,
        SystemClock,
        Arc::new(transport),
    ));
    let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(args.buffer.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some((connection, event)) = outbound.recv().await {
            let line = json!({ "connection": connection, "event": event });
            let mut out = stdout.lock();
            if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
                break;
            }
        }
    });

    let reader_shutdown = shutdown_tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<TransportEvent>(&line) {
                    Ok(event) => {
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring malformed transport event"),
                },
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
        let _ = reader_shutdown.send(true);
    });

    tracing::info!("tether serving on stdin/stdout");
    let core = coordinator.clone();
    let running = tokio::spawn(async move { core.run(events_rx, shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("shutdown signal received");
        }
        _ = wait_for_shutdown(shutdown_tx.subscribe()) => {}
    }
    shutdown_tx.send_replace(true);
    running.await.context("coordinator task panicked")?;
    reader.abort();
    drop(coordinator);
    let _ = writer.await;

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
