//! Downstream delivery targets.
//!
//! The dispatcher hands every transaction to each registered [`Sink`] in
//! order. A transaction counts as delivered only when every sink answered
//! [`Delivery::Ack`].

pub mod json_lines;
pub mod serializer;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SinkConfig;
use crate::postgres::Transaction;
use crate::Result;

pub use json_lines::JsonLinesSink;
pub use serializer::JsonSerializer;

/// A sink's answer to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The transaction is durably accepted.
    Ack,
    /// Temporary failure; the same transaction will be offered again.
    Retry(String),
    /// The sink can never accept this transaction.
    Fatal(String),
}

/// A destination for committed transactions.
///
/// The same transaction may be delivered more than once around a restart;
/// implementations deduplicate on [`Transaction::commit_position`] if they
/// need to.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, transaction: &Transaction) -> Delivery;
}

/// Builds the configured sinks, in configuration order.
pub async fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(configs.len());
    for config in configs {
        let sink = match config {
            SinkConfig::Stdout => JsonLinesSink::stdout(),
            SinkConfig::File { path } => JsonLinesSink::file(path).await?,
        };
        sinks.push(Arc::new(sink));
    }
    Ok(sinks)
}
