//! Replicator service binary.
//!
//! Reads change events as JSON lines from stdin, stores them in a serial log and applies them
//! through a parallel queue. A master replicator first checks that it belongs to the primary
//! partition of its cluster.

use config::shared::ReplicatorConfig;
use telemetry::tracing::init_tracing;
use tracing::error;

use crate::core::start_replicator;
use crate::settings::load_replicator_config;

mod core;
mod settings;
mod sink;
mod source;

fn main() -> anyhow::Result<()> {
    let replicator_config = load_replicator_config()?;

    let _log_flusher = init_tracing(
        env!("CARGO_BIN_NAME"),
        Some(replicator_config.pipeline.id),
    )?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))
}

async fn async_main(replicator_config: ReplicatorConfig) -> anyhow::Result<()> {
    if let Err(err) = start_replicator(replicator_config).await {
        error!("{err:#}");
        return Err(err);
    }

    Ok(())
}
