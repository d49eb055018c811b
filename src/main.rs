//! Courier - Entry Point
//!
//! Reads one URL per line from stdin, fetches them into the output directory
//! and prints the batch result as JSON.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::fetch::DirectorySink;
use courier::{CancelHandle, Config, Downloader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log.level, &config.log.format);

    info!("Starting Courier");

    let urls = read_urls().await.context("failed to read URLs from stdin")?;
    if urls.is_empty() {
        warn!("No URLs on stdin, nothing to do");
        return Ok(());
    }

    let sink = Arc::new(DirectorySink::new(&config.output_dir));
    let downloader = Downloader::new(&config, sink)?;
    info!(
        items = urls.len(),
        workers = downloader.worker_count(),
        output = %config.output_dir.display(),
        "Batch submitted"
    );

    // Cancel on Ctrl+C or SIGTERM; in-flight requests are allowed to finish
    let cancel = CancelHandle::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, finishing in-flight requests");
        signal_cancel.cancel();
    });

    let result = downloader.download_batch(&urls, &cancel).await;
    for item in result.failed() {
        error!(
            index = item.index,
            error = item.error.as_deref().unwrap_or_default(),
            "Item failed"
        );
    }

    println!("{}", serde_json::to_string_pretty(&result)?);

    info!(
        succeeded = result.summary.succeeded,
        failed = result.summary.failed,
        cancelled = result.cancelled,
        "Courier stopped"
    );
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("courier={}", level).into());

    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries the JSON result, so logs go to stderr
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

async fn read_urls() -> std::io::Result<Vec<String>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut urls = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            urls.push(line.to_string());
        }
    }
    Ok(urls)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
