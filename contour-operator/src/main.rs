//! Runs the contour operator against the current kubernetes context

use std::future::Future;

use anyhow::Context as _;
use clap::Parser;
use contour_operator::{Config, Operator};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for `signal`; one that could not be installed never fires.
async fn listen(name: &str, signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(err) = signal.await {
        tracing::warn!(error = %err, "unable to listen for {name}");
        std::future::pending::<()>().await;
    }
}

/// Cancel `shutdown` on ctrl+c or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = listen("ctrl+c", tokio::signal::ctrl_c());
    #[cfg(unix)]
    let terminate = listen("SIGTERM", async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<_, std::io::Error>(())
    });
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl+c"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let mut operator = Operator::new(client, &config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    operator.start(shutdown).await?;

    match tokio::time::timeout(config.shutdown_timeout(), operator.wait_for_shutdown()).await {
        Ok(drained) => drained?,
        Err(_) => tracing::warn!(timeout = ?config.shutdown_timeout(), "controllers did not drain in time"),
    }
    tracing::info!("operator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn failed_listener_never_fires() {
        let failed = listen("ctrl+c", async { Err(std::io::Error::other("no controlling terminal")) });
        assert!(tokio::time::timeout(Duration::from_secs(60), failed).await.is_err());

        let fired = listen("SIGTERM", async { Ok(()) });
        tokio::time::timeout(Duration::from_secs(1), fired).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn other_signal_still_cancels_after_a_failed_listener() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::select! {
            () = listen("ctrl+c", async { Err(std::io::Error::other("no controlling terminal")) }) => {}
            () = listen("SIGTERM", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }) => token.cancel(),
        }
        assert!(shutdown.is_cancelled());
    }
}
