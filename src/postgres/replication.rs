//! The CopyBoth half of a replication connection.
//!
//! Once START_REPLICATION succeeds the socket is split between two tasks:
//!
//! * the **reader** parses CopyData frames, forwards XLogData payloads to
//!   the consumer through a bounded channel and answers nothing itself;
//! * the **status writer** owns the write half and sends standby status
//!   updates on a timer, after a number of received bytes, or when a
//!   primary keepalive asks for a reply.
//!
//! The reader pokes the writer over a small internal channel, so sending an
//! acknowledgement never waits on, or reorders with, receiving WAL. When the
//! consumer stops pulling, the reader blocks on the bounded channel and TCP
//! flow control throttles the server, while the writer keeps the
//! connection alive with status updates.

use bytes::BytesMut;
use futures::Stream;
use postgres_protocol::message::{backend::Message, frontend};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use super::connection::{BoxedRead, BoxedWrite, ReplicationConnection};
use super::protocol::{
    encode_status_update, log_notice, parse_copy_data, server_error, write_all, BackendFrame,
    CopyDataMessage, MessageReader,
};
use super::types::{LogPosition, WalMessage};
use crate::{Error, Result};

/// Tuning for a started stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Send a status update at least this often.
    pub status_interval: Duration,
    /// Also send one after this many received WAL payload bytes.
    pub status_bytes: u64,
    /// Number of received WAL messages that may sit between the socket and
    /// the consumer.
    pub channel_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(10),
            status_bytes: 16 * 1024 * 1024,
            channel_capacity: 16,
        }
    }
}

/// Reports positions whose WAL the server no longer needs to retain.
///
/// Cloneable handle onto the confirmed position shared with the status
/// writer. Positions only ever move forward.
#[derive(Debug, Clone)]
pub struct Acknowledger {
    confirmed: Arc<watch::Sender<LogPosition>>,
}

impl Acknowledger {
    pub fn new(initial: LogPosition) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            confirmed: Arc::new(tx),
        }
    }

    pub fn acknowledge(&self, position: LogPosition) {
        self.confirmed.send_if_modified(|current| {
            if position > *current {
                *current = position;
                true
            } else {
                false
            }
        });
    }

    pub fn confirmed(&self) -> LogPosition {
        *self.confirmed.borrow()
    }
}

#[derive(Debug, Clone, Copy)]
enum StatusTrigger {
    ReplyRequested,
    BytesReceived,
}

/// A running replication stream.
///
/// Yields raw [`WalMessage`]s. A connection fault is yielded once as an
/// `Err` item, after which the stream ends.
pub struct ReplicationStream {
    messages: ReceiverStream<Result<WalMessage>>,
    acknowledger: Acknowledger,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    reader: JoinHandle<Result<MessageReader<BoxedRead>>>,
    writer: JoinHandle<Result<BoxedWrite>>,
    connection: ReplicationConnectionParts,
}

struct ReplicationConnectionParts {
    database: String,
    parameters: std::collections::HashMap<String, String>,
}

impl ReplicationStream {
    pub(crate) fn spawn(
        connection: ReplicationConnection,
        from: LogPosition,
        options: StreamOptions,
    ) -> Self {
        let (reader, writer, database, parameters) = connection.into_parts();

        let acknowledger = Acknowledger::new(from);
        let cancel = CancellationToken::new();
        let received = Arc::new(AtomicU64::new(from.as_u64()));
        let (message_tx, message_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (trigger_tx, trigger_rx) = mpsc::channel(4);

        let reader = tokio::spawn(run_reader(
            reader,
            message_tx,
            trigger_tx,
            received.clone(),
            options.status_bytes,
            cancel.clone(),
        ));
        let writer = tokio::spawn(run_status_writer(
            writer,
            trigger_rx,
            acknowledger.confirmed.subscribe(),
            received,
            options.status_interval,
            cancel.clone(),
        ));

        Self {
            messages: ReceiverStream::new(message_rx),
            acknowledger,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            reader,
            writer,
            connection: ReplicationConnectionParts {
                database,
                parameters,
            },
        }
    }

    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    /// Informs the server that WAL up to `position` need not be retained.
    ///
    /// Takes effect with the next status update.
    pub fn acknowledge(&self, position: LogPosition) {
        self.acknowledger.acknowledge(position);
    }

    /// Token that, once cancelled, makes the stream wind down on its own.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Leaves CopyBoth mode and returns the connection, which can start
    /// streaming again from a new position.
    ///
    /// WAL received but not yet consumed is discarded; it is sent again
    /// after the next start since it was never acknowledged.
    pub async fn stop(self) -> Result<ReplicationConnection> {
        debug!("Stopping replication stream");
        self.cancel.cancel();
        drop(self.messages);

        let writer = self
            .writer
            .await
            .map_err(|e| Error::Protocol(format!("status writer task failed: {}", e)))??;
        let reader = self
            .reader
            .await
            .map_err(|e| Error::Protocol(format!("reader task failed: {}", e)))??;

        info!(
            "Replication stream stopped at confirmed LSN {}",
            self.acknowledger.confirmed()
        );
        Ok(ReplicationConnection::from_parts(
            reader,
            writer,
            self.connection.database,
            self.connection.parameters,
        ))
    }
}

impl Stream for ReplicationStream {
    type Item = Result<WalMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.messages).poll_next(cx)
    }
}

async fn run_reader(
    mut reader: MessageReader<BoxedRead>,
    messages: mpsc::Sender<Result<WalMessage>>,
    triggers: mpsc::Sender<StatusTrigger>,
    received: Arc<AtomicU64>,
    status_bytes: u64,
    cancel: CancellationToken,
) -> Result<MessageReader<BoxedRead>> {
    let mut stopping = false;
    let mut bytes_since_status = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled(), if !stopping => {
                stopping = true;
                continue;
            }
            frame = reader.next_frame() => frame,
        };

        let fault = match frame {
            Ok(BackendFrame::Message(Message::CopyData(body))) => {
                match parse_copy_data(body.into_bytes()) {
                    Ok(CopyDataMessage::XLogData(message)) => {
                        received.fetch_max(message.wal_end.as_u64(), Ordering::AcqRel);
                        bytes_since_status += message.data.len() as u64;
                        if bytes_since_status >= status_bytes {
                            bytes_since_status = 0;
                            let _ = triggers.try_send(StatusTrigger::BytesReceived);
                        }
                        if !stopping {
                            tokio::select! {
                                biased;
                                sent = messages.send(Ok(message)) => {
                                    if sent.is_err() {
                                        debug!("Replication stream consumer went away");
                                        stopping = true;
                                        cancel.cancel();
                                    }
                                }
                                _ = cancel.cancelled() => stopping = true,
                            }
                        }
                        None
                    }
                    Ok(CopyDataMessage::PrimaryKeepalive {
                        wal_end,
                        reply_requested,
                        ..
                    }) => {
                        trace!(wal_end = %wal_end, reply_requested, "Primary keepalive");
                        if reply_requested {
                            let _ = triggers.try_send(StatusTrigger::ReplyRequested);
                        }
                        None
                    }
                    Err(e) => Some(e),
                }
            }
            Ok(BackendFrame::Message(Message::CopyDone)) => {
                if stopping {
                    None
                } else {
                    Some(Error::Connection(
                        "server ended the replication stream".to_string(),
                    ))
                }
            }
            Ok(BackendFrame::Message(Message::CommandComplete(_))) => None,
            Ok(BackendFrame::Message(Message::ReadyForQuery(_))) if stopping => {
                debug!("Server acknowledged end of replication");
                return Ok(reader);
            }
            Ok(BackendFrame::Message(Message::NoticeResponse(body))) => {
                log_notice(&body);
                None
            }
            Ok(BackendFrame::Message(Message::ErrorResponse(body))) => Some(server_error(&body)),
            Ok(BackendFrame::Message(Message::ParameterStatus(_))) => None,
            Ok(_) => Some(Error::Protocol(
                "unexpected message while streaming".to_string(),
            )),
            Err(e) => Some(e),
        };

        if let Some(err) = fault {
            warn!("Replication stream fault: {}", err);
            let summary = err.to_string();
            if !stopping {
                let _ = messages.send(Err(err)).await;
            }
            cancel.cancel();
            return Err(Error::Connection(summary));
        }
    }
}

async fn run_status_writer(
    mut writer: BoxedWrite,
    mut triggers: mpsc::Receiver<StatusTrigger>,
    confirmed: watch::Receiver<LogPosition>,
    received: Arc<AtomicU64>,
    status_interval: Duration,
    cancel: CancellationToken,
) -> Result<BoxedWrite> {
    let mut ticker = interval(status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Starting status updates every {:?}", status_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            Some(trigger) = triggers.recv() => {
                trace!(?trigger, "Status update requested");
            }
        }
        send_status(&mut writer, &confirmed, &received).await?;
    }

    send_status(&mut writer, &confirmed, &received).await?;
    let mut buf = BytesMut::new();
    frontend::copy_done(&mut buf);
    write_all(&mut writer, &buf).await?;
    debug!("Sent CopyDone");
    Ok(writer)
}

async fn send_status(
    writer: &mut BoxedWrite,
    confirmed: &watch::Receiver<LogPosition>,
    received: &AtomicU64,
) -> Result<()> {
    let flush = *confirmed.borrow();
    let write = LogPosition::new(received.load(Ordering::Acquire)).max(flush);

    let mut buf = BytesMut::new();
    encode_status_update(write, flush, flush, chrono::Utc::now(), false, &mut buf)?;
    write_all(writer, &buf).await?;
    trace!(write = %write, flush = %flush, "Sent standby status update");
    Ok(())
}
