//! Shared plumbing for the streaming readers.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

/// How many framed rows may sit between the database task and the
/// upload before the reader blocks.
pub(crate) const CHANNEL_DEPTH: usize = 64;

/// Transfer statistics, final once the stream is drained.
#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    pub rows: i64,
    pub bytes: i64,
    /// Greatest id seen, for incremental imports.
    pub last_id: String,
    /// Rows suppressed for exceeding the row size cap.
    pub oversized: i64,
}

#[derive(Clone, Default)]
pub(crate) struct SharedStats(Arc<Mutex<ImportStats>>);

impl SharedStats {
    pub(crate) fn update(&self, f: impl FnOnce(&mut ImportStats)) {
        let mut guard = self.0.lock().unwrap();
        f(&mut guard);
    }

    pub(crate) fn snapshot(&self) -> ImportStats {
        self.0.lock().unwrap().clone()
    }
}

/// Adapts a bounded tokio channel into the `ByteStream` the object
/// store consumes. An `Err` frame terminates the stream on the reader
/// side.
pub(crate) struct ChannelStream(pub(crate) mpsc::Receiver<std::io::Result<Bytes>>);

impl Stream for ChannelStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

pub(crate) fn io_err(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn shared_stats_snapshot() {
        let stats = SharedStats::default();
        stats.update(|s| {
            s.rows = 10;
            s.last_id = "99".to_string();
        });
        let snap = stats.snapshot();
        assert_eq!(snap.rows, 10);
        assert_eq!(snap.last_id, "99");
    }

    #[tokio::test]
    async fn channel_stream_yields_sent_frames() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"a,b\n"))).await.unwrap();
        drop(tx);

        let mut stream = ChannelStream(rx);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"a,b\n");
        assert!(stream.next().await.is_none());
    }
}
