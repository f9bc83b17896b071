//! Bounded FIFO of committed transactions between ingestion and delivery.
//!
//! [`BufferWriter::push`] waits while the buffer holds `capacity`
//! transactions. That wait is the only throttle in the pipeline: ingestion
//! stops pulling WAL, the replication reader stops reading the socket and
//! TCP flow control pushes back on the server.

use tokio::sync::mpsc;

use crate::postgres::Transaction;
use crate::{Error, Result};

pub struct StreamBuffer;

impl StreamBuffer {
    /// Creates a buffer holding at most `capacity` transactions.
    pub fn bounded(capacity: usize) -> Result<(BufferWriter, BufferReader)> {
        if capacity == 0 {
            return Err(Error::Config(
                "stream buffer capacity must be at least 1".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((BufferWriter { tx, capacity }, BufferReader { rx }))
    }
}

pub struct BufferWriter {
    tx: mpsc::Sender<Transaction>,
    capacity: usize,
}

impl BufferWriter {
    /// Enqueues a transaction, waiting for room if the buffer is full.
    ///
    /// Fails with [`Error::BufferClosed`] once the reader is gone.
    pub async fn push(&self, transaction: Transaction) -> Result<()> {
        self.tx
            .send(transaction)
            .await
            .map_err(|_| Error::BufferClosed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued transactions.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BufferReader {
    rx: mpsc::Receiver<Transaction>,
}

impl BufferReader {
    /// Takes the oldest transaction, waiting while the buffer is empty.
    ///
    /// Returns `None` once the writer is dropped and everything queued has
    /// been taken.
    pub async fn pop(&mut self) -> Option<Transaction> {
        self.rx.recv().await
    }

    /// Stops accepting pushes; queued transactions can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
