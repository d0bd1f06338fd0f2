use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Args;
use tokio::sync::watch;

use crate::commands::{open_pipeline, print_json};

#[derive(Args)]
pub struct ReconcileArgs {
    /// Account to check. Checks every summarized account when omitted
    pub account: Option<String>,
}

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let pipeline = Arc::new(open_pipeline(config_path)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = tokio::spawn(pipeline.clone().run(shutdown_rx));
    shutdown_signal().await;
    tracing::info!("shutdown requested; finishing in-flight work");
    let _ = shutdown_tx.send(true);

    runner.await??;
    Ok(())
}

pub fn drain(config_path: Option<PathBuf>) -> Result<()> {
    let pipeline = open_pipeline(config_path)?;
    let report = pipeline.drain()?;
    print_json(&report)
}

pub fn reconcile(config_path: Option<PathBuf>, args: ReconcileArgs) -> Result<()> {
    let pipeline = open_pipeline(config_path)?;
    let accounts = match args.account {
        Some(account) => vec![account],
        None => pipeline.summary().accounts()?,
    };

    let mut inconsistent = 0usize;
    for account in &accounts {
        let report = pipeline.reconcile(account)?;
        if !report.is_consistent() {
            inconsistent += 1;
        }
        print_json(&report)?;
    }
    if inconsistent > 0 {
        anyhow::bail!(
            "{} of {} account(s) drifted from their stored orders",
            inconsistent,
            accounts.len()
        );
    }
    Ok(())
}

pub fn metrics(config_path: Option<PathBuf>) -> Result<()> {
    let pipeline = open_pipeline(config_path)?;
    if let Some(queue) = pipeline.queue() {
        queue.status()?;
    }
    print!("{}", streamcqrs::observability::render());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
