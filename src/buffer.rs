//! Store-and-forward buffer for outbound messages.
//!
//! While the node is offline (or a publish fails), telemetry lands here
//! instead of being lost. The buffer is a bounded FIFO with a lossy
//! oldest-first eviction policy: memory stays bounded through an outage of any
//! length, at the cost of dropping the stalest messages once capacity is hit.
//!
//! Draining snapshots the buffer, clears it, and replays entries in their
//! original order; a failed send goes back through `enqueue` at the tail.
//! Under sustained failure this can reorder delivery relative to newly arrived
//! messages and evict fresh entries in favor of retried ones. Known behavior,
//! kept as-is pending design review.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::device::DeviceMetrics;

pub const DEFAULT_CAPACITY: usize = 50;

/// An outbound message that has never been confirmed delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Monotonic ms at enqueue time.
    pub enqueued_at: u64,
}

pub struct MessageBuffer {
    entries: VecDeque<PendingMessage>,
    capacity: usize,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a message, evicting the oldest entry first when at capacity.
    pub fn enqueue(
        &mut self,
        topic: String,
        payload: Vec<u8>,
        now_ms: u64,
        metrics: &mut DeviceMetrics,
    ) {
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                warn!(
                    topic = %evicted.topic,
                    age_ms = now_ms.saturating_sub(evicted.enqueued_at),
                    "buffer full, evicting oldest message"
                );
            }
        }
        self.entries.push_back(PendingMessage {
            topic,
            payload,
            enqueued_at: now_ms,
        });
        metrics.buffered_messages += 1;
        debug!(buffered = self.entries.len(), "message buffered");
    }

    /// Replays the buffered messages through `send` in arrival order.
    ///
    /// Only meaningful while the session is fully connected; the runtime
    /// enforces that. The live buffer is cleared up front so that sends and
    /// new arrivals interleave through the normal enqueue path; each failed
    /// send is re-enqueued and competes for capacity like any other message.
    pub fn drain<F>(&mut self, now_ms: u64, metrics: &mut DeviceMetrics, mut send: F)
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        if self.entries.is_empty() {
            return;
        }
        let snapshot: Vec<PendingMessage> = self.entries.drain(..).collect();
        debug!(count = snapshot.len(), "draining buffered messages");

        for message in snapshot {
            if send(&message.topic, &message.payload) {
                metrics.sent_from_buffer += 1;
            } else {
                metrics.failed_publish += 1;
                warn!(topic = %message.topic, "buffered send failed, re-enqueueing");
                self.enqueue(message.topic, message.payload, now_ms, metrics);
            }
        }
    }

    /// Empties the buffer unconditionally (remote `clearBuffer` command).
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    #[cfg(test)]
    pub fn topics(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.topic.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metrics() -> DeviceMetrics {
        DeviceMetrics::at_boot(Utc::now())
    }

    fn fill(buffer: &mut MessageBuffer, metrics: &mut DeviceMetrics, topics: &[&str]) {
        for t in topics {
            buffer.enqueue((*t).to_string(), b"{}".to_vec(), 0, metrics);
        }
    }

    #[test]
    fn capacity_overflow_evicts_oldest_first() {
        let mut m = metrics();
        let mut buffer = MessageBuffer::new(3);
        fill(&mut buffer, &mut m, &["a", "b", "c", "d"]);

        assert_eq!(buffer.topics(), vec!["b", "c", "d"]);
        assert_eq!(m.buffered_messages, 4);
    }

    #[test]
    fn drain_sends_in_arrival_order() {
        let mut m = metrics();
        let mut buffer = MessageBuffer::new(10);
        fill(&mut buffer, &mut m, &["a", "b", "c"]);

        let mut sent = Vec::new();
        buffer.drain(100, &mut m, |topic, _| {
            sent.push(topic.to_string());
            true
        });

        assert_eq!(sent, vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
        assert_eq!(m.sent_from_buffer, 3);
        assert_eq!(m.failed_publish, 0);
    }

    #[test]
    fn failed_send_is_reenqueued() {
        let mut m = metrics();
        let mut buffer = MessageBuffer::new(10);
        fill(&mut buffer, &mut m, &["a", "b", "c"]);

        buffer.drain(100, &mut m, |topic, _| topic != "b");

        assert_eq!(buffer.topics(), vec!["b"]);
        assert_eq!(m.sent_from_buffer, 2);
        assert_eq!(m.failed_publish, 1);
    }

    #[test]
    fn clear_empties_unconditionally() {
        let mut m = metrics();
        let mut buffer = MessageBuffer::new(10);
        fill(&mut buffer, &mut m, &["a", "b"]);

        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
    }
}
