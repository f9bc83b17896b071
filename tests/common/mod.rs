#![allow(dead_code)]

use futures::stream::{self, Stream, StreamExt};
use railgun::postgres::WalMessage;
use railgun::testing::pgoutput::TransactionScript;
use railgun::{RetryPolicy, Result};
use std::future::Future;
use std::time::Duration;

/// Backoff short enough that retry tests finish quickly.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        multiplier: 2.0,
    }
}

/// `count` single-row transactions on public.users, xids from 100 upwards,
/// each 0x100 apart in the log. Only the first carries the relation.
pub fn scripts(count: usize) -> Vec<TransactionScript> {
    (0..count)
        .map(|i| {
            let script = TransactionScript::new(100 + i as u32, 0x1000 + 0x100 * i as u64)
                .insert(i as i32 + 1, &format!("user-{}", i + 1));
            if i == 0 {
                script
            } else {
                script.without_relation()
            }
        })
        .collect()
}

pub fn messages(scripts: &[TransactionScript]) -> Vec<WalMessage> {
    scripts.iter().flat_map(|script| script.build()).collect()
}

/// A finite WAL source.
pub fn source(messages: Vec<WalMessage>) -> impl Stream<Item = Result<WalMessage>> + Unpin {
    stream::iter(messages.into_iter().map(Ok))
}

/// A WAL source that yields `messages` and then stays open, like a live
/// replication stream with nothing more to send.
pub fn open_source(messages: Vec<WalMessage>) -> impl Stream<Item = Result<WalMessage>> + Unpin {
    Box::pin(stream::iter(messages.into_iter().map(Ok)).chain(stream::pending()))
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation timed out")
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("railgun=debug")
        .with_test_writer()
        .try_init()
        .ok();
}
