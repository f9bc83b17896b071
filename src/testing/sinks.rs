use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::postgres::{LogPosition, Transaction};
use crate::sink::{Delivery, Sink};

/// A sink that answers from a script and records what it acknowledged.
///
/// Once the script runs out every delivery is acknowledged. A gated sink
/// additionally waits for [`release`](ScriptedSink::release) before each
/// attempt, which lets tests stall the dispatcher.
pub struct ScriptedSink {
    name: String,
    answers: Mutex<VecDeque<Delivery>>,
    delivered: Mutex<Vec<Transaction>>,
    attempts: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answers: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn with_answers(name: &str, answers: impl IntoIterator<Item = Delivery>) -> Self {
        let sink = Self::new(name);
        sink.push_answers(answers);
        sink
    }

    pub fn gated(name: &str) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(name)
        }
    }

    /// `retries` Retry answers followed by acknowledgements.
    pub fn flaky(name: &str, retries: usize) -> Self {
        Self::with_answers(
            name,
            (0..retries).map(|i| Delivery::Retry(format!("transient failure {}", i + 1))),
        )
    }

    pub fn push_answers(&self, answers: impl IntoIterator<Item = Delivery>) {
        self.answers.lock().unwrap().extend(answers);
    }

    /// Lets `n` more delivery attempts through a gated sink.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Transaction> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_positions(&self) -> Vec<LogPosition> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|tx| tx.commit_position)
            .collect()
    }

    pub fn delivered_xids(&self) -> Vec<u32> {
        self.delivered.lock().unwrap().iter().map(|tx| tx.xid).collect()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, transaction: &Transaction) -> Delivery {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Delivery::Ack);
        if answer == Delivery::Ack {
            self.delivered.lock().unwrap().push(transaction.clone());
        }
        answer
    }
}
