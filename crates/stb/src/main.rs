use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stb_core::{config::Config, pipeline::Pipeline};
use stb_ssh::{SftpConnector, SshOptions};
use stb_telegram::TelegramDelivery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stb_core::logging::init("stb")?;

    let cfg = Arc::new(Config::load().context("invalid configuration")?);

    let connector = Arc::new(SftpConnector::new(SshOptions::from_config(&cfg)));
    let delivery = Arc::new(TelegramDelivery::new(&cfg)?);

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(cfg.clone(), connector, delivery).with_cancellation(cancel.clone());

    let run = pipeline.run();
    tokio::pin!(run);

    // First signal: finish the current item, skip the rest.
    // Second signal: abandon the run; drop guards still clean up local files.
    let summary = tokio::select! {
        res = &mut run => res,
        _ = shutdown_signal() => {
            warn!("shutdown requested, stopping after the current item");
            cancel.cancel();
            tokio::select! {
                res = &mut run => res,
                _ = shutdown_signal() => {
                    error!("second shutdown signal, aborting run");
                    anyhow::bail!("run aborted by signal");
                }
            }
        }
    };

    let summary = match summary {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "backup run failed");
            return Err(e).context("backup run failed");
        }
    };
    if summary.has_failures() {
        warn!(failed = summary.failed(), "some items were not delivered");
    }
    if summary.interrupted {
        info!(not_attempted = summary.not_attempted, "run was interrupted");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
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
