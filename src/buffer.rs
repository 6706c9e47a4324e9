//! Per-socket receive buffer.
//!
//! Payloads are staged as whole chunks in arrival order, one chunk per
//! accepted data segment. Chunks are never merged, so message
//! boundaries survive and a zero-length payload is observable as a
//! zero-length read. A read larger than the front chunk returns just
//! that chunk; a smaller read splits it and leaves the tail queued.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct RecvBuffer {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
}

impl RecvBuffer {
    pub(crate) fn new() -> RecvBuffer {
        RecvBuffer {
            chunks: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Queues one payload chunk and wakes a pending reader.
    pub(crate) fn deliver(&self, chunk: Vec<u8>) {
        self.chunks.lock().unwrap().push_back(chunk);
        self.ready.notify_one();
    }

    /// Takes up to `max` bytes from the front chunk, waiting for a
    /// delivery if the buffer is empty. Never spans chunks.
    pub(crate) async fn recv(&self, max: usize) -> Vec<u8> {
        loop {
            // Arm the notification before re-checking the queue so a
            // deliver racing with this read cannot be missed.
            let notified = self.ready.notified();
            {
                let mut chunks = self.chunks.lock().unwrap();
                if let Some(front) = chunks.front_mut() {
                    if front.len() <= max {
                        // `front` was just matched, the queue is non-empty.
                        return chunks.pop_front().unwrap();
                    }
                    let rest = front.split_off(max);
                    return std::mem::replace(front, rest);
                }
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn delivered_chunk_is_read_back() {
        let buf = RecvBuffer::new();
        buf.deliver(b"hello".to_vec());
        assert_eq!(buf.recv(1024).await, b"hello");
    }

    #[tokio::test]
    async fn empty_chunk_is_a_valid_message() {
        let buf = RecvBuffer::new();
        buf.deliver(Vec::new());
        assert_eq!(buf.recv(1024).await, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn short_read_splits_the_front_chunk() {
        let buf = RecvBuffer::new();
        buf.deliver(b"hello world".to_vec());
        assert_eq!(buf.recv(5).await, b"hello");
        assert_eq!(buf.recv(1024).await, b" world");
    }

    #[tokio::test]
    async fn reads_never_span_chunks() {
        let buf = RecvBuffer::new();
        buf.deliver(b"ab".to_vec());
        buf.deliver(b"cd".to_vec());
        assert_eq!(buf.recv(10).await, b"ab");
        assert_eq!(buf.recv(10).await, b"cd");
    }

    #[tokio::test]
    async fn recv_waits_for_a_delivery() {
        let buf = Arc::new(RecvBuffer::new());
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.recv(1024).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.deliver(b"late".to_vec());
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"late");
    }
}
