use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::pipeline::{Pipeline, PipelineSummary, Shutdown};
use crate::postgres::{LogPosition, ReplicationConnection};
use crate::sink::{build_sinks, Sink};
use crate::{Config, Result};

/// Runs one replication slot end to end: connects, attaches the slot,
/// streams from the checkpoint and tears the connection down again.
pub struct Replicator {
    config: Config,
    checkpoints: Arc<dyn CheckpointStore>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl Replicator {
    pub fn new(config: Config, checkpoints: Arc<dyn CheckpointStore>, sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            config,
            checkpoints,
            sinks,
        }
    }

    /// Opens the configured checkpoint directory and sinks.
    pub async fn from_config(config: Config) -> Result<Self> {
        let checkpoints = FileCheckpointStore::open(&config.checkpoint.directory).await?;
        let sinks = build_sinks(&config.sinks).await?;
        Ok(Self::new(config, Arc::new(checkpoints), sinks))
    }

    pub fn slot_name(&self) -> &str {
        &self.config.postgres.slot_name
    }

    pub async fn run(&self, shutdown: &Shutdown) -> Result<PipelineSummary> {
        let slot = self.slot_name();
        let resume = self
            .checkpoints
            .load(slot)
            .await?
            .map(|checkpoint| checkpoint.confirmed_position);
        match resume {
            Some(position) => info!(slot = %slot, "Resuming after checkpoint {}", position),
            None => info!(slot = %slot, "No checkpoint, starting from the slot position"),
        }

        let options = self.config.connect_options()?;
        let graceful = shutdown.graceful_token();
        let mut connection = tokio::select! {
            _ = graceful.cancelled() => return Ok(PipelineSummary::default()),
            connection = ReplicationConnection::connect(&options) => connection?,
        };

        let system = connection.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            "Server WAL position is {}",
            system.xlogpos
        );

        let slot_info = connection.ensure_slot(slot).await?;
        if slot_info.created {
            if let Some(checkpoint) = resume {
                warn!(
                    slot = %slot,
                    "Slot was just created but a checkpoint at {} exists; changes before the slot are lost",
                    checkpoint
                );
            }
        }

        let from = resume.unwrap_or(LogPosition::ZERO);
        let mut stream = connection
            .start_streaming(
                slot,
                &self.config.postgres.publication,
                from,
                self.config.stream_options(),
            )
            .await?;

        let pipeline = Pipeline::with_acknowledger(
            slot,
            self.sinks.clone(),
            self.checkpoints.clone(),
            self.config.pipeline_options(),
            stream.acknowledger(),
        );
        let result = pipeline.run(&mut stream, from, shutdown).await;

        match result {
            Ok(summary) if !summary.aborted => {
                match stream.stop().await {
                    Ok(connection) => {
                        if let Err(e) = connection.close().await {
                            warn!("Failed to close replication connection: {}", e);
                        }
                    }
                    Err(e) => warn!("Replication stream did not stop cleanly: {}", e),
                }
                Ok(summary)
            }
            Ok(summary) => {
                info!("Immediate shutdown, dropping replication connection");
                drop(stream);
                Ok(summary)
            }
            Err(e) => {
                drop(stream);
                Err(e)
            }
        }
    }
}

/// Drops the configured replication slot. The server stops retaining WAL
/// for it, so a later run cannot resume where an earlier one left off.
pub async fn drop_slot(config: &Config) -> Result<bool> {
    let slot = &config.postgres.slot_name;
    let mut connection = ReplicationConnection::connect(&config.connect_options()?).await?;
    let dropped = connection.drop_slot(slot).await?;
    connection.close().await?;
    if dropped {
        info!(slot = %slot, "Dropped replication slot");
    } else {
        info!(slot = %slot, "Replication slot does not exist");
    }
    Ok(dropped)
}
