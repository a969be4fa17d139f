use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::warn;

use crate::config::RetryQueueConfig;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RetryMessage {
    payload: Bytes,
    retry_count: u32,
    retry_available: bool,
}

impl RetryMessage {
    pub fn new(payload: Bytes, retry_available: bool) -> RetryMessage {
        RetryMessage {
            payload,
            retry_count: 0,
            retry_available,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_retry_available(&self) -> bool {
        self.retry_available
    }

    /// to be called before re-adding a message whose redelivery failed
    pub fn fail_and_increment_retry_count(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }
}

/// Bounded FIFO of messages awaiting redelivery. When it fills up, messages that were retried
///  before are shed first: once the queue is half full, only fresh messages are accepted.
///
/// Dropping a message is not an error, it is logged.
pub struct RetryQueue {
    capacity: usize,
    max_retry_count: u32,
    queue: Mutex<VecDeque<RetryMessage>>,
}

impl RetryQueue {
    pub fn new(config: &RetryQueueConfig) -> RetryQueue {
        RetryQueue {
            capacity: config.capacity,
            max_retry_count: config.max_retry_count,
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
        }
    }

    /// Returns `true` if the message was queued, `false` if it was dropped.
    pub fn add(&self, message: RetryMessage) -> bool {
        if !message.retry_available {
            warn!(len=message.payload.len(), "message is not eligible for retry - dropping");
            return false;
        }
        if message.retry_count >= self.max_retry_count {
            warn!(len=message.payload.len(), retry_count=message.retry_count, "message reached the maximum retry count - dropping");
            return false;
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            warn!(len=message.payload.len(), capacity=self.capacity, "retry queue is full - dropping message");
            return false;
        }
        if message.retry_count > 0 && queue.len() >= self.capacity / 2 {
            warn!(len=message.payload.len(), retry_count=message.retry_count, queue_size=queue.len(), "retry queue is half full, dropping message that was retried before");
            return false;
        }

        queue.push_back(message);
        true
    }

    /// removes and returns the oldest message
    pub fn get(&self) -> Option<RetryMessage> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn size(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn queue(capacity: usize, max_retry_count: u32) -> RetryQueue {
        RetryQueue::new(&RetryQueueConfig { capacity, max_retry_count })
    }

    fn message(n: u8, retry_count: u32) -> RetryMessage {
        let mut result = RetryMessage::new(Bytes::from(vec![n]), true);
        for _ in 0..retry_count {
            result.fail_and_increment_retry_count();
        }
        result
    }

    #[test]
    fn test_capacity_and_fifo() {
        let queue = queue(4, 3);
        let added = (0..5)
            .map(|n| queue.add(message(n, 0)))
            .collect::<Vec<_>>();
        assert_eq!(added, vec![true, true, true, true, false]);
        assert_eq!(queue.size(), 4);

        let drained = std::iter::from_fn(|| queue.get())
            .map(|m| m.payload()[0])
            .collect::<Vec<_>>();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(queue.get().is_none());
        assert!(queue.is_empty());
    }

    #[rstest]
    #[case::fresh(0, true)]
    #[case::retried(2, true)]
    #[case::max_reached(3, false)]
    #[case::beyond_max(4, false)]
    fn test_max_retry_count(#[case] retry_count: u32, #[case] expected: bool) {
        let queue = queue(4, 3);
        assert_eq!(queue.add(message(1, retry_count)), expected);
    }

    #[test]
    fn test_not_retry_available() {
        let queue = queue(4, 3);
        assert!(!queue.add(RetryMessage::new(Bytes::from_static(b"x"), false)));
        assert_eq!(queue.size(), 0);
    }

    #[rstest]
    #[case::below_half(1, 1, true)]
    #[case::half_full_retried(2, 1, false)]
    #[case::half_full_fresh(2, 0, true)]
    #[case::three_quarters_fresh(3, 0, true)]
    fn test_shedding_retried_messages(#[case] prefill: u8, #[case] retry_count: u32, #[case] expected: bool) {
        let queue = queue(4, 3);
        for n in 0..prefill {
            assert!(queue.add(message(n, 0)));
        }
        assert_eq!(queue.add(message(99, retry_count)), expected);
    }

    #[test]
    fn test_retry_count_only_increases() {
        let mut m = message(1, 0);
        assert_eq!(m.retry_count(), 0);
        assert_eq!(m.fail_and_increment_retry_count(), 1);
        assert_eq!(m.fail_and_increment_retry_count(), 2);
        assert!(m.is_retry_available());
    }
}
