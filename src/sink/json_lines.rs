use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Delivery, JsonSerializer, Sink};
use crate::postgres::Transaction;
use crate::{Error, Result};

enum Output {
    Stdout(Stdout),
    File { file: File, path: PathBuf },
}

/// Writes each transaction as one JSON line to stdout or an append-only file.
///
/// File output is synced before a delivery is acknowledged.
pub struct JsonLinesSink {
    name: String,
    output: Mutex<Output>,
}

impl JsonLinesSink {
    /// Writes records to stdout. The binary logs to stderr, so the stream
    /// carries one JSON record per line and nothing else.
    pub fn stdout() -> Self {
        Self {
            name: "stdout".to_string(),
            output: Mutex::new(Output::Stdout(tokio::io::stdout())),
        }
    }

    pub async fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Config(format!("Cannot open sink file {:?}: {}", path, e)))?;

        Ok(Self {
            name: format!("file:{}", path.display()),
            output: Mutex::new(Output::File { file, path }),
        })
    }

    async fn write_line(output: &mut Output, line: &[u8]) -> std::io::Result<()> {
        match output {
            Output::Stdout(out) => write_and_flush(out, line).await,
            Output::File { file, .. } => {
                write_and_flush(file, line).await?;
                file.sync_data().await
            }
        }
    }
}

async fn write_and_flush<W: AsyncWrite + Unpin>(out: &mut W, line: &[u8]) -> std::io::Result<()> {
    out.write_all(line).await?;
    out.flush().await
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, transaction: &Transaction) -> Delivery {
        let mut line = match JsonSerializer::serialize(transaction) {
            Ok(line) => line,
            Err(e) => return Delivery::Fatal(format!("serialization failed: {}", e)),
        };
        line.push('\n');

        let mut output = self.output.lock().await;
        match Self::write_line(&mut output, line.as_bytes()).await {
            Ok(()) => {
                debug!(
                    sink = %self.name,
                    xid = transaction.xid,
                    "Wrote transaction at {}",
                    transaction.commit_position
                );
                Delivery::Ack
            }
            Err(e) => {
                if let Output::File { path, .. } = &*output {
                    warn!(sink = %self.name, "Write to {:?} failed: {}", path, e);
                }
                Delivery::Retry(e.to_string())
            }
        }
    }
}
