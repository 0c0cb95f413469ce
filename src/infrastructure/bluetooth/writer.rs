//! Dedicated writer task.
//!
//! ```text
//! connect handshake ─┐
//! command gate ──────┼─► mpsc::UnboundedSender<Vec<u8>> ─► Writer Task ─► stream
//! gate timer ────────┘
//! ```
//!
//! The task is the only writer of the stream. Each queued item is one
//! complete frame written with `write_all`, so frames never interleave and go
//! out in the order they were accepted.

use crate::error::{ProtocolError, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Anything that accepts complete frames for transmission
pub trait FrameSink: Send + Sync {
    fn enqueue(&self, frame: Vec<u8>) -> Result<()>;
}

/// Cheaply cloneable handle to the writer task
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSink for WriterHandle {
    fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| ProtocolError::TransportUnavailable)
    }
}

/// Spawn the writer task over the write half of the stream
pub fn spawn_writer_task<W>(mut writer: W, cancel: CancellationToken) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            trace!("TX {:02X?}", frame);
            // Best effort: a lost command is superseded by the next one
            let result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = result {
                warn!("Failed to write frame {:02X?}: {}", frame, e);
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Writer shutdown: {}", e);
        }
        debug!("Writer task stopped");
    });

    (WriterHandle { tx }, task)
}
