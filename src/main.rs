use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use distexp::agent::Agent;
use distexp::config::{init_logging, AgentConfig};
use distexp::supervisor::LineBuffering;
use distexp::DistexpError;

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Got Ctrl-C"),
        _ = terminate.recv() => info!("Got SIGTERM"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DistexpError> {
    let config = AgentConfig::parse();
    init_logging(config.verbose, config.log_file.as_deref())?;

    let line_buffering = LineBuffering::detect();
    if line_buffering.is_none() {
        warn!("stdbuf not found, child output will not be line buffered");
    }

    let agent = Agent::bind((config.ip, config.port))
        .await?
        .with_idle_limit(config.idle_limit())
        .with_line_buffering(line_buffering);
    info!("Listening on {}", agent.local_addr()?);

    agent.serve(shutdown_signal()).await
}
