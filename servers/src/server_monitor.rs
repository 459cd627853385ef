use std::sync::Arc;

use anyhow::Result;
use tokio::signal;

mod monitor_logic;
use monitor_logic::{config, logger};

use lib_watch::channel::WsTransport;
use lib_watch::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config();
    logger::setup_logging(settings.log_dir(), settings.log_level())?;

    let core_config = settings.to_core_config()?;
    log::info!(
        "Starting monitor ingestion core (backend: {})",
        core_config.channel.url
    );

    let orchestrator = Orchestrator::new(core_config, Arc::new(WsTransport));
    orchestrator.start().await?;

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    orchestrator.stop().await;
    log::info!("Shutdown complete.");
    Ok(())
}
