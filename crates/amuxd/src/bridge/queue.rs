//! Bounded per-client frame queue with drop-oldest backpressure.
//!
//! Output and scrollback frames for one client are buffered here. When the
//! queued payload exceeds the byte budget, the oldest frames are discarded
//! and counted; the newest frame always survives. State-update frames
//! never travel through this queue and are never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use amux_protocol::DaemonFrame;

/// Per-client output queue budget.
pub const MAX_CLIENT_QUEUE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct Inner {
    frames: VecDeque<DaemonFrame>,
    queued_bytes: usize,
}

/// Byte-budgeted frame queue shared between the bridge actor (producer)
/// and one client's send loop (consumer).
pub struct FrameQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_bytes: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_bytes,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues a frame, discarding the oldest frames while over budget.
    pub fn push(&self, frame: DaemonFrame) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.queued_bytes += frame.payload_bytes();
            inner.frames.push_back(frame);

            while inner.queued_bytes > self.max_bytes && inner.frames.len() > 1 {
                if let Some(dropped) = inner.frames.pop_front() {
                    inner.queued_bytes -= dropped.payload_bytes();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Dequeues the next frame, waiting until one is available.
    pub async fn pop(&self) -> DaemonFrame {
        loop {
            let notified = self.notify.notified();
            {
                if let Ok(mut inner) = self.inner.lock() {
                    if let Some(frame) = inner.frames.pop_front() {
                        inner.queued_bytes -= frame.payload_bytes();
                        return frame;
                    }
                }
            }
            notified.await;
        }
    }

    /// Frames discarded so far for this client.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|i| i.frames.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amux_core::SessionId;

    fn output(bytes: usize) -> DaemonFrame {
        DaemonFrame::output(SessionId::new("ab12cd34"), "x".repeat(bytes))
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = FrameQueue::new(1024);
        q.push(DaemonFrame::output(SessionId::new("ab12cd34"), "1".into()));
        q.push(DaemonFrame::output(SessionId::new("ab12cd34"), "2".into()));

        let first = q.pop().await;
        let second = q.pop().await;
        assert!(matches!(first, DaemonFrame::Output { data, .. } if data == "1"));
        assert!(matches!(second, DaemonFrame::Output { data, .. } if data == "2"));
    }

    #[tokio::test]
    async fn drops_oldest_over_budget() {
        let q = FrameQueue::new(100);
        q.push(output(60));
        q.push(output(60)); // first is discarded
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn newest_frame_survives_even_oversized() {
        let q = FrameQueue::new(100);
        q.push(output(500));
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().await.payload_bytes(), 500);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(FrameQueue::new(1024));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(output(4));
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("pop never woke")
            .expect("task panicked");
        assert_eq!(frame.payload_bytes(), 4);
    }
}
