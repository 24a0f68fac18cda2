//! Line-framed transport for miner connections.
//!
//! Stratum v1 is newline-delimited JSON over TCP. The reader enforces a hard
//! line-length cap so a hostile peer cannot balloon the buffer; an oversize
//! line or malformed JSON surfaces as an error and the session closes with
//! no response. Reading and writing are split so a dedicated writer task can
//! drain the session's outbound queue.

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::messages::JsonRpcMessage;

/// Maximum accepted line length. Longer lines close the session.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Why reading from a session stopped.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Line exceeded [`MAX_LINE_LENGTH`]
    #[error("oversize line")]
    OversizeLine,

    /// Line was not a JSON-RPC message
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Reading half of a miner connection.
pub struct MessageReader {
    frames: FramedRead<OwnedReadHalf, LinesCodec>,
}

/// Writing half of a miner connection.
pub struct MessageWriter {
    writer: BufWriter<OwnedWriteHalf>,
}

/// Split a fresh TCP stream into framed halves.
pub fn split(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let (read_half, write_half) = stream.into_split();

    let reader = MessageReader {
        frames: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
    };
    let writer = MessageWriter {
        writer: BufWriter::new(write_half),
    };

    (reader, writer)
}

impl MessageReader {
    /// Read one message. `Ok(None)` is a clean EOF; blank lines are skipped.
    pub async fn read_message(&mut self) -> Result<Option<JsonRpcMessage>, ConnectionError> {
        loop {
            let line = match self.frames.next().await {
                None => return Ok(None),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(ConnectionError::OversizeLine)
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(ConnectionError::Io(e)),
                Some(Ok(line)) => line,
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

impl MessageWriter {
    /// Serialize and send one message.
    pub async fn write_message(&mut self, msg: &JsonRpcMessage) -> std::io::Result<()> {
        let json = serde_json::to_string(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}
