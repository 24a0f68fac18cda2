//! Share and block record persistence.
//!
//! Accepted shares and submitted blocks are appended as JSON lines under
//! the configured data directory, one file per record kind. The writer is a
//! single task fed over a channel so the validation path never touches the
//! filesystem. Only the record shape is a contract; downstream tooling does
//! whatever it likes with the files.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::tracing::prelude::*;

/// One accepted share.
#[derive(Debug, Clone, Serialize)]
pub struct ShareRecord {
    pub ts: u64,
    pub worker: String,
    pub address: String,
    pub difficulty: f64,
    pub block_found: bool,
}

/// One block handed to the node.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub ts: u64,
    pub height: u64,
    /// Display-order block hash hex
    pub hash: String,
    pub finder_address: String,
    pub worker: String,
    /// Coinbase value, satoshis
    pub reward: u64,
}

/// Anything the recorder persists.
#[derive(Debug, Clone)]
pub enum Record {
    Share(ShareRecord),
    Block(BlockRecord),
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Append-only record writer task.
pub struct Recorder {
    dir: PathBuf,
    rx: mpsc::Receiver<Record>,
}

impl Recorder {
    pub fn new(dir: PathBuf, rx: mpsc::Receiver<Record>) -> Self {
        Self { dir, rx }
    }

    /// Drain records until every sender is gone. Write failures are logged
    /// and never propagate; losing a record must not affect mining.
    pub async fn run(mut self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!(dir = %self.dir.display(), error = %e, "Cannot create data directory; records disabled");
            while self.rx.recv().await.is_some() {}
            return;
        }

        let mut shares = open_append(self.dir.join("shares.jsonl")).await;
        let mut blocks = open_append(self.dir.join("blocks.jsonl")).await;

        while let Some(record) = self.rx.recv().await {
            let (file, line) = match &record {
                Record::Share(share) => (&mut shares, serde_json::to_string(share)),
                Record::Block(block) => (&mut blocks, serde_json::to_string(block)),
            };

            let Ok(line) = line else { continue };
            if let Some(file) = file {
                if let Err(e) = write_line(file, &line).await {
                    warn!(error = %e, "Failed to append record");
                }
            }
        }
    }
}

async fn open_append(path: PathBuf) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot open record file");
            None
        }
    }
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
