//! Decoding, assembly, buffering and delivery of one replication slot.
//!
//! A [`Pipeline`] runs two halves joined by the [`StreamBuffer`]:
//!
//! * ingestion pulls [`WalMessage`]s from any source stream, decodes them,
//!   assembles transactions and pushes them into the buffer;
//! * delivery pops transactions and hands them to the [`Dispatcher`].
//!
//! The pipeline does not know about sockets, so tests can feed it a plain
//! vector of messages.

pub mod assembler;
pub mod buffer;
pub mod dispatcher;

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::postgres::{Acknowledger, LogPosition, PgOutputDecoder, WalMessage};
use crate::sink::Sink;
use crate::{Error, Result};

pub use assembler::TransactionAssembler;
pub use buffer::{BufferReader, BufferWriter, StreamBuffer};
pub use dispatcher::{DispatchStats, Dispatcher, RetryPolicy};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub buffer_capacity: usize,
    pub max_transaction_events: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            max_transaction_events: 100_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shutdown signals shared by the pipeline and whoever stops it.
///
/// Graceful shutdown stops reading WAL and lets buffered transactions drain
/// to the sinks. Immediate shutdown also abandons the buffer; the next run
/// redelivers from the last checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    immediate: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graceful(&self) {
        self.graceful.cancel();
    }

    /// Implies graceful.
    pub fn immediate(&self) {
        self.graceful.cancel();
        self.immediate.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate.is_cancelled()
    }

    pub fn graceful_token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    pub fn immediate_token(&self) -> CancellationToken {
        self.immediate.clone()
    }
}

/// What a pipeline run got done.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSummary {
    pub transactions_delivered: u64,
    pub events_delivered: u64,
    /// Transactions at or before the resume position that were not redelivered.
    pub transactions_skipped: u64,
    pub last_confirmed: Option<LogPosition>,
    /// True if immediate shutdown cut the run short.
    pub aborted: bool,
}

pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        slot: impl Into<String>,
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: PipelineOptions,
    ) -> Self {
        Self::with_dispatcher(
            Dispatcher::new(slot, sinks, checkpoints, options.retry.clone()),
            options,
        )
    }

    pub fn with_dispatcher(dispatcher: Dispatcher, options: PipelineOptions) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            options,
        }
    }

    /// Builds a pipeline that also reports confirmed positions to a
    /// replication stream.
    pub fn with_acknowledger(
        slot: impl Into<String>,
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: PipelineOptions,
        acknowledger: Acknowledger,
    ) -> Self {
        let dispatcher = Dispatcher::new(slot, sinks, checkpoints, options.retry.clone())
            .with_acknowledger(acknowledger);
        Self::with_dispatcher(dispatcher, options)
    }

    /// Runs until the source ends, a fault occurs, or shutdown is requested.
    ///
    /// Transactions whose commit position is at or below `resume_after` were
    /// already delivered by an earlier run and are skipped.
    pub async fn run<S>(&self, source: S, resume_after: LogPosition, shutdown: &Shutdown) -> Result<PipelineSummary>
    where
        S: Stream<Item = Result<WalMessage>> + Unpin,
    {
        let (writer, reader) = StreamBuffer::bounded(self.options.buffer_capacity)?;

        let dispatcher = self.dispatcher.clone();
        let abort = shutdown.immediate_token();
        let halted = CancellationToken::new();
        let on_failure = halted.clone();
        let delivery = tokio::spawn(async move {
            let result = dispatcher.run(reader, abort).await;
            if result.is_err() {
                on_failure.cancel();
            }
            result
        });

        let ingested = self
            .ingest(source, writer, resume_after, shutdown, &halted)
            .await;

        let delivered = delivery
            .await
            .map_err(|e| Error::Protocol(format!("dispatcher task failed: {}", e)))?;

        // A delivery failure closes the buffer, which ingestion then sees as
        // BufferClosed; report the delivery failure.
        let stats = delivered?;
        let skipped = ingested?;

        let summary = PipelineSummary {
            transactions_delivered: stats.transactions,
            events_delivered: stats.events,
            transactions_skipped: skipped,
            last_confirmed: stats.last_confirmed,
            aborted: shutdown.is_immediate(),
        };
        info!(
            transactions = summary.transactions_delivered,
            events = summary.events_delivered,
            skipped = summary.transactions_skipped,
            "Pipeline stopped"
        );
        Ok(summary)
    }

    /// Returns the number of skipped transactions.
    async fn ingest<S>(
        &self,
        mut source: S,
        writer: BufferWriter,
        resume_after: LogPosition,
        shutdown: &Shutdown,
        halted: &CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<WalMessage>> + Unpin,
    {
        let mut decoder = PgOutputDecoder::new();
        let mut assembler = TransactionAssembler::new(self.options.max_transaction_events);
        let graceful = shutdown.graceful_token();
        let immediate = shutdown.immediate_token();
        let mut skipped = 0u64;

        loop {
            let message = tokio::select! {
                biased;
                _ = halted.cancelled() => return Err(Error::BufferClosed),
                _ = graceful.cancelled() => {
                    if !assembler.is_idle() {
                        debug!("Discarding partially received transaction on shutdown");
                    }
                    info!("Shutdown requested, no longer reading WAL");
                    break;
                }
                next = source.next() => match next {
                    Some(message) => message?,
                    None => {
                        debug!("Source stream ended");
                        break;
                    }
                },
            };

            let decoded = decoder.decode(&message)?;
            let Some(transaction) = assembler.apply(decoded)? else {
                continue;
            };

            if transaction.commit_position <= resume_after {
                debug!(
                    xid = transaction.xid,
                    "Skipping transaction at {} (checkpoint {})",
                    transaction.commit_position,
                    resume_after
                );
                skipped += 1;
                continue;
            }

            let pushed = tokio::select! {
                biased;
                _ = immediate.cancelled() => break,
                pushed = writer.push(transaction) => pushed,
            };
            if pushed.is_err() {
                warn!("Delivery stopped, ending ingestion");
                return Err(Error::BufferClosed);
            }
        }

        Ok(skipped)
    }
}
