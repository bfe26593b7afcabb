//! Stream translation: upstream chunks to a caller-facing byte stream.
//!
//! A spawned pump task pulls [`UpstreamChunk`]s and forwards their text
//! through a bounded channel. The caller's body reads from the receiving
//! end. Capacity is one item, so upstream is only read about as fast as the
//! caller drains. Dropping the receiver (client disconnect) stops the pump
//! and drops the upstream stream, which releases the provider connection.

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::types::UpstreamChunk;
use crate::error::Error;

/// Items buffered between the pump and the caller.
const CHANNEL_CAPACITY: usize = 1;

/// Byte stream handed to the HTTP response body.
pub type ByteStream = ReceiverStream<io::Result<Bytes>>;

/// How a translated stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Upstream ended naturally; the body closed cleanly.
    Completed,
    /// Upstream failed mid-flight; the body ended with an error.
    Aborted,
    /// The caller went away; upstream reading stopped.
    Cancelled,
}

/// Summary of one translated stream, returned by the pump task.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    /// Non-empty chunks forwarded to the caller.
    pub chunks: usize,
    pub bytes: usize,
    pub outcome: StreamOutcome,
    pub duration: Duration,
}

/// Start translating `chunks` into a byte stream.
///
/// Chunks are forwarded in arrival order, one write per non-empty delta;
/// empty deltas are skipped. An upstream error is delivered as a single
/// `Err` item, after which the stream ends.
pub fn translate<S>(chunks: S) -> (ByteStream, JoinHandle<StreamSummary>)
where
    S: Stream<Item = Result<UpstreamChunk, Error>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(pump(chunks, tx).in_current_span());
    (ReceiverStream::new(rx), handle)
}

async fn pump<S>(mut chunks: S, tx: mpsc::Sender<io::Result<Bytes>>) -> StreamSummary
where
    S: Stream<Item = Result<UpstreamChunk, Error>> + Unpin,
{
    let start = Instant::now();
    let mut forwarded = 0usize;
    let mut bytes = 0usize;

    let outcome = loop {
        let next = tokio::select! {
            _ = tx.closed() => break StreamOutcome::Cancelled,
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let Some(text) = chunk.delta.filter(|d| !d.is_empty()) else {
                    continue;
                };
                let len = text.len();
                if tx.send(Ok(Bytes::from(text))).await.is_err() {
                    break StreamOutcome::Cancelled;
                }
                forwarded += 1;
                bytes += len;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, chunks = forwarded, "upstream stream failed mid-flight");
                // Headers are already committed; all that is left is to abort the body.
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                break StreamOutcome::Aborted;
            }
            None => break StreamOutcome::Completed,
        }
    };
    drop(chunks);

    let summary = StreamSummary {
        chunks: forwarded,
        bytes,
        outcome,
        duration: start.elapsed(),
    };
    match outcome {
        StreamOutcome::Completed => tracing::info!(
            chunks = summary.chunks,
            bytes = summary.bytes,
            duration_ms = summary.duration.as_millis() as u64,
            "stream completed"
        ),
        StreamOutcome::Cancelled => tracing::info!(
            chunks = summary.chunks,
            bytes = summary.bytes,
            "caller disconnected, upstream stream released"
        ),
        StreamOutcome::Aborted => tracing::warn!(
            chunks = summary.chunks,
            bytes = summary.bytes,
            "stream aborted after partial output"
        ),
    }
    summary
}
