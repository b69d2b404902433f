//! Bet uploader: sends an agency's bets to the lottery server.
//!
//! Usage:
//!   CLI_ID=1 CLI_SERVER_ADDRESS=server:12345 ./target/release/bet-uploader
//!   CLI_ID=2 CLI_LOOP_PERIOD=100ms CLI_BATCH_MAX_AMOUNT=50 CLI_LOG_LEVEL=debug ./target/release/bet-uploader

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use bet_uploader::logging::init_logging;
use bet_uploader::signals::spawn_watcher;
use bet_uploader::{records, ClientConfig, Error, State, TracingSink, UploadController};

#[tokio::main]
async fn main() -> ExitCode {
    // ========================================================================
    // Configuration
    // ========================================================================

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", Error::from(e));
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        // Aborted runs were already reported and still shut down in order.
        Ok(state) => {
            info!(?state, "client finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(action = "start", result = "fail", error = %e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ClientConfig) -> Result<State, Error> {
    info!(
        action = "config",
        result = "success",
        client_id = %config.id,
        server_address = %config.server_address,
        loop_period = ?config.loop_period,
        batch_max_amount = config.batch_max_amount,
        log_level = %config.log_level
    );

    // ========================================================================
    // Record source
    // ========================================================================

    let path = config.bets_path();
    let source = records::open(&path, &config.id)
        .await
        .map_err(|source| Error::BetsFile {
            path: path.display().to_string(),
            source,
        })?;

    // ========================================================================
    // Controller + signal watcher
    // ========================================================================

    let cancel = CancellationToken::new();
    let sink = Arc::new(TracingSink::new(config.id.clone()));
    let client_id = config.id.clone();
    let controller = UploadController::new(config, cancel.clone(), sink);
    let watcher = spawn_watcher(cancel.clone(), controller.closer(), client_id);

    let report = controller.run(source).await;

    // Stops the watcher if no signal arrived.
    cancel.cancel();
    if let Err(e) = watcher.await {
        debug!(error = %e, "signal watcher ended abnormally");
    }

    info!(
        batches = report.batches_sent,
        records = report.records_sent,
        rejected = report.records_rejected,
        acks_ok = report.acks_ok,
        acks_failed = report.acks_failed,
        cancelled = report.cancelled,
        "upload summary"
    );
    Ok(report.state)
}
