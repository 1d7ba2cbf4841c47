// Message sources for the ingest loop.
//
// `next()` must be cancel-safe: the loop races it against the flush timer and
// the shutdown token, and a message must not be lost when another branch wins.
// `commit()` is called only after a flush has emptied every buffer, so a
// source that can replay (a broker consumer group) gets at-least-once
// delivery, and idempotent writes turn that into no duplicates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::warn;

/// Longest NDJSON line accepted before it is dropped as malformed.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[async_trait]
pub trait MessageSource: Send {
    /// Next raw message, or `None` once the source is exhausted.
    async fn next(&mut self) -> Result<Option<Vec<u8>>>;

    /// Acknowledge every message returned so far as durably written.
    async fn commit(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// LineSource
// ---------------------------------------------------------------------------

/// Newline-delimited JSON from a file, pipe, or socket.
pub struct LineSource<R> {
    lines: FramedRead<R, LinesCodec>,
    delivered: u64,
    committed: u64,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            delivered: 0,
            committed: 0,
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for LineSource<R> {
    async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    self.delivered += 1;
                    return Ok(Some(line.into_bytes()));
                }
                // Yielded as an empty message so the router counts it.
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(max_bytes = MAX_LINE_BYTES, "Dropping oversized line");
                    self.delivered += 1;
                    return Ok(Some(Vec::new()));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.committed = self.delivered;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChannelSource
// ---------------------------------------------------------------------------

/// In-process source fed through an mpsc channel. Ends when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
    delivered: u64,
    committed: Arc<AtomicU64>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self {
            rx,
            delivered: 0,
            committed: Arc::new(AtomicU64::new(0)),
        };
        (tx, source)
    }

    /// Shared view of the commit position, readable after the source moves
    /// into the ingest loop.
    pub fn commit_position(&self) -> Arc<AtomicU64> {
        self.committed.clone()
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.delivered += 1;
        }
        Ok(msg)
    }

    async fn commit(&mut self) -> Result<()> {
        self.committed.store(self.delivered, Ordering::SeqCst);
        Ok(())
    }
}
