use tracing::{debug, trace};

use crate::postgres::{BeginMarker, ChangeEvent, CommitMarker, DecodedMessage, Transaction};
use crate::{Error, Result};

#[derive(Debug)]
enum AssemblerState {
    Idle,
    Accumulating {
        begin: BeginMarker,
        events: Vec<ChangeEvent>,
    },
}

/// Groups decoded messages between BEGIN and COMMIT into transactions.
///
/// Any marker or change arriving in the wrong state is a fault: the stream
/// always starts on a transaction boundary, so it can only mean the server
/// and decoder disagree.
#[derive(Debug)]
pub struct TransactionAssembler {
    state: AssemblerState,
    max_events: usize,
}

impl TransactionAssembler {
    pub fn new(max_events: usize) -> Self {
        Self {
            state: AssemblerState::Idle,
            max_events,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, AssemblerState::Idle)
    }

    /// Feeds one decoded message; returns the transaction it completes, if any.
    pub fn apply(&mut self, message: DecodedMessage) -> Result<Option<Transaction>> {
        match message {
            DecodedMessage::Begin(begin) => self.begin(begin).map(|_| None),
            DecodedMessage::Change(event) => self.push(std::iter::once(event)).map(|_| None),
            DecodedMessage::Truncate(events) => self.push(events).map(|_| None),
            DecodedMessage::Commit(commit) => self.commit(commit).map(Some),
            DecodedMessage::Relation { .. } | DecodedMessage::Ignored(_) => Ok(None),
        }
    }

    fn begin(&mut self, begin: BeginMarker) -> Result<()> {
        if let AssemblerState::Accumulating { begin: open, .. } = &self.state {
            return Err(Error::Assembly(format!(
                "BEGIN of xid {} while xid {} is still open",
                begin.xid, open.xid
            )));
        }
        trace!(xid = begin.xid, "Transaction started");
        self.state = AssemblerState::Accumulating {
            begin,
            events: Vec::new(),
        };
        Ok(())
    }

    fn push(&mut self, new_events: impl IntoIterator<Item = ChangeEvent>) -> Result<()> {
        let AssemblerState::Accumulating { begin, events } = &mut self.state else {
            return Err(Error::Assembly(
                "change event outside of a transaction".to_string(),
            ));
        };

        for event in new_events {
            if events.len() >= self.max_events {
                return Err(Error::TransactionTooLarge {
                    xid: begin.xid,
                    limit: self.max_events,
                });
            }
            events.push(event);
        }
        Ok(())
    }

    fn commit(&mut self, commit: CommitMarker) -> Result<Transaction> {
        match std::mem::replace(&mut self.state, AssemblerState::Idle) {
            AssemblerState::Idle => Err(Error::Assembly(format!(
                "COMMIT at {} without a transaction",
                commit.commit_lsn
            ))),
            AssemblerState::Accumulating { begin, events } => {
                if begin.final_lsn != commit.commit_lsn {
                    return Err(Error::Assembly(format!(
                        "COMMIT at {} does not match BEGIN of xid {} (expected {})",
                        commit.commit_lsn, begin.xid, begin.final_lsn
                    )));
                }
                debug!(
                    xid = begin.xid,
                    events = events.len(),
                    "Transaction committed at {}",
                    commit.end_lsn
                );
                Ok(Transaction {
                    xid: begin.xid,
                    commit_lsn: commit.commit_lsn,
                    commit_position: commit.end_lsn,
                    commit_time: commit.commit_time,
                    events,
                })
            }
        }
    }
}
