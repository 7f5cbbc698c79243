//! The distbuild daemons and the `distbuild` client command.

use crate::cli::CliError;
use morph_distbuild::{
    Controller, ControllerConfig, DistbuildOutcome, WorkerConfig, WorkerDaemon, render_event,
    run_distbuild,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// `morph controller-daemon`.
pub async fn controller(
    listen_initiators: SocketAddr,
    listen_workers: SocketAddr,
    shared_cache: String,
) -> Result<(), CliError> {
    let controller = Controller::new(ControllerConfig {
        initiator_addr: listen_initiators,
        worker_addr: listen_workers,
        shared_cache_url: shared_cache,
        morph_command: "morph".to_string(),
    });
    controller
        .run(None)
        .await
        .map_err(|e| CliError::internal(e.to_string()))
}

/// `morph worker-daemon`: serve, reconnecting when the controller goes away.
pub async fn worker(
    controller_addr: String,
    name: String,
    cache_url: String,
    parallel_builds: usize,
) -> Result<(), CliError> {
    loop {
        let daemon = WorkerDaemon::new(WorkerConfig {
            name: name.clone(),
            controller_addr: controller_addr.clone(),
            cache_url: cache_url.clone(),
            parallel_builds,
        });
        match daemon.run().await {
            Ok(()) => {
                info!("Controller closed the connection; reconnecting");
            }
            Err(e) => {
                warn!(error = %e, "Worker connection failed; reconnecting");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// `morph distbuild`: submit a request and stream its progress.
pub async fn distbuild(
    controller_addr: &str,
    repo: &str,
    ref_name: &str,
    morphology: &str,
) -> Result<(), CliError> {
    let outcome = run_distbuild(controller_addr, repo, ref_name, morphology, |message| {
        if let Some(line) = render_event(message) {
            println!("{line}");
        }
    })
    .await
    .map_err(|e| CliError::internal(e.to_string()))?;

    match outcome {
        DistbuildOutcome::Finished => Ok(()),
        DistbuildOutcome::Failed { reason } => {
            Err(CliError::build(format!("distributed build failed: {reason}")))
        }
    }
}
