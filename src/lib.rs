pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod replicator;
pub mod sink;

pub mod postgres;

/// Test doubles: a scripted walsender, pgoutput builders and sinks.
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineOptions, PipelineSummary, RetryPolicy, Shutdown};
pub use postgres::{ChangeEvent, ColumnValue, LogPosition, Transaction};
pub use replicator::Replicator;
pub use sink::{Delivery, Sink};
