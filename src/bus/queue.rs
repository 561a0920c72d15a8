//! Bounded ingress queue coupling bus receive tasks to the pipeline worker
//!
//! Back-pressure policy: when the queue is full, new frames are dropped and
//! counted. Receive tasks never block. The consumer drains in bounded
//! batches to keep latency spikes in check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 20_000;

/// Largest batch the consumer pulls per tick.
pub const MAX_BATCH: usize = 300;

enum Ingress {
    Frame(Frame),
    /// Shutdown sentinel: the consumer stops after draining up to it.
    Shutdown,
}

/// Producer half, cheap to clone into every receive task.
#[derive(Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<Ingress>,
    dropped: Arc<AtomicU64>,
}

impl IngressSender {
    /// Enqueue without blocking; full queue drops the frame and counts it.
    pub fn push(&self, frame: Frame) {
        if self.tx.try_send(Ingress::Frame(frame)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Enqueue the shutdown sentinel. Waits for a slot so the sentinel is
    /// never lost to the drop policy.
    pub async fn push_shutdown(&self) {
        let _ = self.tx.send(Ingress::Shutdown).await;
    }

    /// Frames dropped by the back-pressure policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the single pipeline worker.
pub struct IngressReceiver {
    rx: mpsc::Receiver<Ingress>,
}

impl IngressReceiver {
    /// Wait for at least one frame, then drain up to `MAX_BATCH` without
    /// waiting. Returns `None` once the shutdown sentinel (or channel close)
    /// is reached; frames drained before the sentinel are returned first.
    pub async fn pop_batch(&mut self) -> Option<Vec<Frame>> {
        let first = self.rx.recv().await?;
        let mut batch = Vec::new();
        match first {
            Ingress::Frame(frame) => batch.push(frame),
            Ingress::Shutdown => return None,
        }
        while batch.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(Ingress::Frame(frame)) => batch.push(frame),
                Ok(Ingress::Shutdown) => {
                    self.rx.close();
                    break;
                }
                Err(_) => break,
            }
        }
        Some(batch)
    }
}

/// Build a bounded ingress queue.
pub fn ingress_queue(capacity: usize) -> (IngressSender, IngressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        IngressSender { tx, dropped: Arc::new(AtomicU64::new(0)) },
        IngressReceiver { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: u32) -> Frame {
        Frame::new(i as f64, 0x100 + (i % 0x100), vec![i as u8], false, "CAN1").unwrap()
    }

    #[tokio::test]
    async fn test_batch_pop_bounded() {
        let (tx, mut rx) = ingress_queue(1000);
        for i in 0..500 {
            tx.push(frame(i));
        }
        let batch = rx.pop_batch().await.unwrap();
        assert_eq!(batch.len(), MAX_BATCH);
        let batch = rx.pop_batch().await.unwrap();
        assert_eq!(batch.len(), 500 - MAX_BATCH);
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let (tx, mut rx) = ingress_queue(10);
        for i in 0..25 {
            tx.push(frame(i));
        }
        assert_eq!(tx.dropped(), 15);
        let batch = rx.pop_batch().await.unwrap();
        assert_eq!(batch.len(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_sentinel_ends_stream() {
        let (tx, mut rx) = ingress_queue(10);
        tx.push(frame(1));
        tx.push_shutdown().await;
        // Frames ahead of the sentinel still drain.
        let batch = rx.pop_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(rx.pop_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_immediate_shutdown() {
        let (tx, mut rx) = ingress_queue(10);
        tx.push_shutdown().await;
        assert!(rx.pop_batch().await.is_none());
    }
}
