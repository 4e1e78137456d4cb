//! Thread-safe FIFO of discrete byte messages.
//!
//! Each [`PacketQueue::enqueue`] call stores exactly one message and each
//! [`PacketQueue::dequeue`] call hands back exactly one, so message
//! boundaries survive the hand-off between application code and the
//! session worker.

use crate::error::QueueError;
use crate::lock;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default maximum message size (transport MTU)
pub const DEFAULT_MTU: usize = 1400;

/// FIFO of byte messages bounded by a maximum message size
#[derive(Debug)]
pub struct PacketQueue {
    messages: Mutex<VecDeque<Bytes>>,
    max_message_size: usize,
}

impl PacketQueue {
    /// Create a queue accepting messages up to `max_message_size` bytes
    pub fn new(max_message_size: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            max_message_size,
        }
    }

    /// Largest message the queue accepts
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Append one message, returning the number of bytes accepted
    ///
    /// Empty input is accepted as a no-op and returns 0.
    pub fn enqueue(&self, data: &[u8]) -> Result<usize, QueueError> {
        if data.len() > self.max_message_size {
            return Err(QueueError::Oversized {
                len: data.len(),
                max: self.max_message_size,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        lock(&self.messages).push_back(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    /// Copy the oldest message into `buffer`, returning its length
    ///
    /// Returns 0 when the queue is empty. A buffer too small for the head
    /// message leaves it queued.
    pub fn dequeue(&self, buffer: &mut [u8]) -> Result<usize, QueueError> {
        let mut messages = lock(&self.messages);
        let Some(head) = messages.front() else {
            return Ok(0);
        };
        if head.len() > buffer.len() {
            return Err(QueueError::BufferTooSmall {
                needed: head.len(),
                capacity: buffer.len(),
            });
        }

        let len = head.len();
        buffer[..len].copy_from_slice(head);
        messages.pop_front();
        Ok(len)
    }

    /// Take the oldest message
    pub fn pop(&self) -> Option<Bytes> {
        lock(&self.messages).pop_front()
    }

    /// Return a message to the head of the queue
    pub fn push_front(&self, message: Bytes) {
        lock(&self.messages).push_front(message);
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }

    /// Discard every queued message
    pub fn clear(&self) {
        lock(&self.messages).clear();
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::default();
        queue.enqueue(b"A").unwrap();
        queue.enqueue(b"BB").unwrap();
        queue.enqueue(b"CCC").unwrap();

        let mut buffer = [0u8; 16];
        let n = queue.dequeue(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"A");
        let n = queue.dequeue(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"BB");
        let n = queue.dequeue(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"CCC");
    }

    #[test]
    fn test_dequeue_empty_returns_zero() {
        let queue = PacketQueue::default();
        let mut buffer = [0u8; 8];
        assert_eq!(queue.dequeue(&mut buffer).unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oversized_rejected() {
        let queue = PacketQueue::new(4);
        assert_eq!(
            queue.enqueue(b"hello"),
            Err(QueueError::Oversized { len: 5, max: 4 })
        );
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(b"four").unwrap(), 4);
    }

    #[test]
    fn test_small_buffer_keeps_message() {
        let queue = PacketQueue::default();
        queue.enqueue(b"message").unwrap();

        let mut small = [0u8; 3];
        assert_eq!(
            queue.dequeue(&mut small),
            Err(QueueError::BufferTooSmall {
                needed: 7,
                capacity: 3
            })
        );
        assert_eq!(queue.len(), 1);

        let mut buffer = [0u8; 7];
        assert_eq!(queue.dequeue(&mut buffer).unwrap(), 7);
        assert_eq!(&buffer, b"message");
    }

    #[test]
    fn test_push_front_restores_head() {
        let queue = PacketQueue::default();
        queue.enqueue(b"second").unwrap();
        queue.push_front(Bytes::from_static(b"first"));
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(queue.pop().unwrap(), Bytes::from_static(b"second"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_producer_consumer_threads() {
        let queue = Arc::new(PacketQueue::default());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0u32..500 {
                    queue.enqueue(&i.to_be_bytes()).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        let mut buffer = [0u8; 4];
        while received.len() < 500 {
            let n = queue.dequeue(&mut buffer).unwrap();
            if n == 4 {
                received.push(u32::from_be_bytes(buffer));
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        let expected: Vec<u32> = (0..500).collect();
        assert_eq!(received, expected);
    }
}
