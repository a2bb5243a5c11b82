//! Bounded frame hand-off between the capture loop and one stream.
//!
//! Single producer (the capture loop) and single consumer (the stream's
//! send task). Capacity 10 with drop-oldest on overflow: a stalled
//! consumer always wakes to the newest frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::RemoteFrame;

/// Frames buffered per subscriber before the oldest is dropped.
pub const FRAME_CHANNEL_CAPACITY: usize = 10;

pub struct FrameChannel {
    queue: Mutex<VecDeque<Arc<RemoteFrame>>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl FrameChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(FRAME_CHANNEL_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: FRAME_CHANNEL_CAPACITY,
        })
    }

    /// Enqueue a frame, evicting the oldest when full. Returns `false`
    /// once the channel is closed.
    pub fn offer(&self, frame: Arc<RemoteFrame>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() == self.capacity {
                queue.pop_front();
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame; `None` after close once drained.
    pub async fn recv(&self) -> Option<Arc<RemoteFrame>> {
        loop {
            // Register interest before re-checking so a concurrent offer
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();

            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::PooledBytes;
    use crate::capture::FrameFormat;
    use std::time::Duration;

    fn frame(sequence: u64) -> Arc<RemoteFrame> {
        Arc::new(RemoteFrame {
            sequence,
            timestamp_ms: 0,
            width: 4,
            height: 4,
            format: FrameFormat::Jpeg,
            data: PooledBytes::unpooled(vec![0xAB]),
        })
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let channel = FrameChannel::new();
        for sequence in 0..3 {
            assert!(channel.offer(frame(sequence)));
        }
        for sequence in 0..3 {
            assert_eq!(channel.recv().await.unwrap().sequence, sequence);
        }
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest() {
        let channel = FrameChannel::new();
        // 15 frames against capacity 10: the consumer sees the 10 newest.
        for sequence in 0..15 {
            channel.offer(frame(sequence));
        }
        assert_eq!(channel.len(), FRAME_CHANNEL_CAPACITY);
        for sequence in 5..15 {
            assert_eq!(channel.recv().await.unwrap().sequence, sequence);
        }
    }

    #[tokio::test]
    async fn close_wakes_and_drains() {
        let channel = FrameChannel::new();
        channel.offer(frame(7));
        channel.close();
        assert!(!channel.offer(frame(8)));

        // Buffered frame still drains, then the channel reports closed.
        assert_eq!(channel.recv().await.unwrap().sequence, 7);
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_offer() {
        let channel = FrameChannel::new();
        let receiver = Arc::clone(&channel);
        let task = tokio::spawn(async move { receiver.recv().await.map(|f| f.sequence) });
        tokio::task::yield_now().await;
        channel.offer(frame(42));
        assert_eq!(task.await.unwrap(), Some(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_producer_never_reorders() {
        let channel = FrameChannel::new();
        let receiver = Arc::clone(&channel);

        let consumer = tokio::spawn(async move {
            let mut last = 0u64;
            while let Some(frame) = receiver.recv().await {
                assert!(frame.sequence > last, "{} after {}", frame.sequence, last);
                last = frame.sequence;
            }
            last
        });

        let producer = Arc::clone(&channel);
        let produce = std::thread::spawn(move || {
            for sequence in 1..=500 {
                producer.offer(frame(sequence));
                if sequence % 50 == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            producer.close();
        });

        produce.join().unwrap();
        let last = consumer.await.unwrap();
        // Drops are allowed (oldest first); order is not negotiable.
        assert!(last > 0);
    }
}
