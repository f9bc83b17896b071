use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::BufferReader;
use crate::checkpoint::CheckpointStore;
use crate::postgres::{Acknowledger, LogPosition, Transaction};
use crate::sink::{Delivery, Sink};
use crate::{Error, Result};

/// Bounded exponential backoff for sinks answering `Retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// How many Retry answers a sink may give for one transaction.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Totals of one dispatcher run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    pub transactions: u64,
    pub events: u64,
    pub last_confirmed: Option<LogPosition>,
}

/// Delivers transactions to every sink, in order, then advances the
/// checkpoint.
pub struct Dispatcher {
    slot: String,
    sinks: Vec<Arc<dyn Sink>>,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    acknowledger: Option<Acknowledger>,
}

impl Dispatcher {
    pub fn new(
        slot: impl Into<String>,
        sinks: Vec<Arc<dyn Sink>>,
        checkpoints: Arc<dyn CheckpointStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            slot: slot.into(),
            sinks,
            checkpoints,
            retry,
            acknowledger: None,
        }
    }

    /// Confirmed positions are also reported to the replication stream.
    pub fn with_acknowledger(mut self, acknowledger: Acknowledger) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    /// Pops and delivers transactions until the buffer is drained and
    /// closed, a delivery fails for good, or `abort` fires.
    ///
    /// A failed transaction is not checkpointed and nothing after it is
    /// popped, so the next run starts with that transaction again.
    pub async fn run(&self, mut buffer: BufferReader, abort: CancellationToken) -> Result<DispatchStats> {
        let mut stats = DispatchStats::default();

        loop {
            let transaction = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    info!("Dispatcher aborted with transactions possibly still buffered");
                    break;
                }
                next = buffer.pop() => match next {
                    Some(tx) => tx,
                    None => break,
                },
            };

            let delivered = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    info!(xid = transaction.xid, "Dispatcher aborted during delivery");
                    break;
                }
                result = self.dispatch(&transaction, &abort) => result,
            };

            if let Err(e) = delivered {
                error!(
                    xid = transaction.xid,
                    position = %transaction.commit_position,
                    "Halting dispatcher: {}",
                    e
                );
                buffer.close();
                return Err(e);
            }

            stats.transactions += 1;
            stats.events += transaction.len() as u64;
            stats.last_confirmed = Some(transaction.commit_position);
        }

        debug!(
            transactions = stats.transactions,
            events = stats.events,
            "Dispatcher finished"
        );
        Ok(stats)
    }

    /// Delivers one transaction to all sinks and checkpoints it.
    pub async fn dispatch(&self, transaction: &Transaction, abort: &CancellationToken) -> Result<()> {
        for sink in &self.sinks {
            self.deliver_to(sink.as_ref(), transaction, abort).await?;
        }

        let position = transaction.commit_position;
        if !self.checkpoints.advance(&self.slot, position).await? {
            debug!(slot = %self.slot, "Checkpoint already at or beyond {}", position);
        }
        if let Some(acknowledger) = &self.acknowledger {
            acknowledger.acknowledge(position);
        }
        Ok(())
    }

    async fn deliver_to(&self, sink: &dyn Sink, transaction: &Transaction, abort: &CancellationToken) -> Result<()> {
        let mut retries = 0u32;

        loop {
            match sink.deliver(transaction).await {
                Delivery::Ack => {
                    if retries > 0 {
                        info!(
                            sink = %sink.name(),
                            xid = transaction.xid,
                            "Delivered after {} retries",
                            retries
                        );
                    }
                    return Ok(());
                }
                Delivery::Fatal(reason) => {
                    return Err(Error::SinkFatal {
                        sink: sink.name().to_string(),
                        position: transaction.commit_position,
                        reason,
                    });
                }
                Delivery::Retry(reason) => {
                    retries += 1;
                    if retries > self.retry.max_retries {
                        return Err(Error::DeliveryExhausted {
                            sink: sink.name().to_string(),
                            position: transaction.commit_position,
                            attempts: retries,
                            reason,
                        });
                    }

                    let delay = self.retry.backoff(retries);
                    warn!(
                        sink = %sink.name(),
                        xid = transaction.xid,
                        retry = retries,
                        "Delivery failed ({}), retrying in {:?}",
                        reason,
                        delay
                    );
                    tokio::select! {
                        _ = abort.cancelled() => return Err(Error::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::pipeline::buffer::StreamBuffer;
    use crate::testing::sinks::ScriptedSink;
    use chrono::Utc;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn transaction(xid: u32, position: u64) -> Transaction {
        Transaction {
            xid,
            commit_lsn: LogPosition::new(position - 0x10),
            commit_position: LogPosition::new(position),
            commit_time: Utc::now(),
            events: vec![],
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sinks_called_in_order_then_checkpoint() {
        let first = Arc::new(ScriptedSink::new("first"));
        let second = Arc::new(ScriptedSink::new("second"));
        let store = Arc::new(MemoryCheckpointStore::new());
        let ack = Acknowledger::new(LogPosition::ZERO);
        let dispatcher = Dispatcher::new(
            "slot",
            vec![first.clone(), second.clone()],
            store.clone(),
            fast_retry(1),
        )
        .with_acknowledger(ack.clone());

        dispatcher
            .dispatch(&transaction(1, 0x100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.delivered_xids(), vec![1]);
        assert_eq!(second.delivered_xids(), vec![1]);
        assert_eq!(store.position("slot"), Some(LogPosition::new(0x100)));
        assert_eq!(ack.confirmed(), LogPosition::new(0x100));
    }

    #[tokio::test]
    async fn test_fatal_sink_stops_before_later_sinks_and_checkpoint() {
        let broken = Arc::new(ScriptedSink::with_answers(
            "broken",
            [Delivery::Fatal("schema mismatch".to_string())],
        ));
        let after = Arc::new(ScriptedSink::new("after"));
        let store = Arc::new(MemoryCheckpointStore::new());
        let dispatcher = Dispatcher::new("slot", vec![broken.clone(), after.clone()], store.clone(), fast_retry(3));

        let err = dispatcher
            .dispatch(&transaction(1, 0x100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SinkFatal { ref sink, .. } if sink == "broken"));
        assert_eq!(after.attempts(), 0);
        assert_eq!(store.position("slot"), None);
    }

    #[tokio::test]
    async fn test_retry_then_ack_within_budget() {
        let sink = Arc::new(ScriptedSink::flaky("flaky", 3));
        let store = Arc::new(MemoryCheckpointStore::new());
        let dispatcher = Dispatcher::new("slot", vec![sink.clone()], store.clone(), fast_retry(5));

        dispatcher
            .dispatch(&transaction(1, 0x100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.attempts(), 4);
        assert_eq!(sink.delivered_xids(), vec![1]);
        assert_eq!(store.position("slot"), Some(LogPosition::new(0x100)));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let sink = Arc::new(ScriptedSink::flaky("flaky", 10));
        let store = Arc::new(MemoryCheckpointStore::new());
        let dispatcher = Dispatcher::new("slot", vec![sink.clone()], store.clone(), fast_retry(3));

        let err = dispatcher
            .dispatch(&transaction(1, 0x100), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::DeliveryExhausted { attempts, position, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(position, LogPosition::new(0x100));
            }
            other => panic!("Expected exhausted budget, got {:?}", other),
        }
        assert_eq!(sink.attempts(), 4);
        assert_eq!(store.position("slot"), None);
    }

    #[tokio::test]
    async fn test_run_halts_on_failure_without_popping_more() {
        let sink = Arc::new(ScriptedSink::with_answers(
            "sink",
            [Delivery::Ack, Delivery::Fatal("boom".to_string())],
        ));
        let store = Arc::new(MemoryCheckpointStore::new());
        let dispatcher = Dispatcher::new("slot", vec![sink.clone()], store.clone(), fast_retry(0));

        let (writer, reader) = StreamBuffer::bounded(4).unwrap();
        for (xid, pos) in [(1, 0x100), (2, 0x200), (3, 0x300)] {
            writer.push(transaction(xid, pos)).await.unwrap();
        }

        let err = dispatcher.run(reader, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::SinkFatal { .. }));
        assert_eq!(sink.attempts(), 2);
        assert_eq!(store.position("slot"), Some(LogPosition::new(0x100)));
        assert!(matches!(
            writer.push(transaction(4, 0x400)).await,
            Err(Error::BufferClosed)
        ));
    }

    #[tokio::test]
    async fn test_abort_interrupts_backoff() {
        let sink = Arc::new(ScriptedSink::flaky("flaky", 10));
        let store = Arc::new(MemoryCheckpointStore::new());
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(3600),
            multiplier: 1.0,
        };
        let dispatcher = Dispatcher::new("slot", vec![sink.clone()], store.clone(), policy);
        let (writer, reader) = StreamBuffer::bounded(1).unwrap();
        writer.push(transaction(1, 0x100)).await.unwrap();

        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let stats = dispatcher.run(reader, abort).await.unwrap();
        assert_eq!(stats.transactions, 0);
        assert_eq!(store.position("slot"), None);
    }
}
