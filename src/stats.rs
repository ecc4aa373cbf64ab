use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared counters maintained by the transport, read by the owning distribution layer.
///
/// All counters are updated with relaxed ordering: they feed monitoring, not control flow.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,

    async_queued_msgs: AtomicU64,
    async_dequeued_msgs: AtomicU64,
    async_conflated_msgs: AtomicU64,
    async_queue_size_exceeded: AtomicU64,
    async_queue_timeouts: AtomicU64,
    /// current byte total across all async queues; adjusted symmetrically on enqueue and dequeue
    async_queue_size_bytes: AtomicI64,
}

impl ConnectionStats {
    pub fn new() -> ConnectionStats {
        ConnectionStats::default()
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn inc_async_queued_msgs(&self) {
        self.async_queued_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn async_queued_msgs(&self) -> u64 {
        self.async_queued_msgs.load(Ordering::Relaxed)
    }

    pub fn inc_async_dequeued_msgs(&self) {
        self.async_dequeued_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn async_dequeued_msgs(&self) -> u64 {
        self.async_dequeued_msgs.load(Ordering::Relaxed)
    }

    pub fn inc_async_conflated_msgs(&self) {
        self.async_conflated_msgs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn async_conflated_msgs(&self) -> u64 {
        self.async_conflated_msgs.load(Ordering::Relaxed)
    }

    pub fn inc_async_queue_size_exceeded(&self) {
        self.async_queue_size_exceeded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn async_queue_size_exceeded(&self) -> u64 {
        self.async_queue_size_exceeded.load(Ordering::Relaxed)
    }

    pub fn inc_async_queue_timeouts(&self) {
        self.async_queue_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn async_queue_timeouts(&self) -> u64 {
        self.async_queue_timeouts.load(Ordering::Relaxed)
    }

    pub fn adjust_async_queue_size(&self, delta: i64) {
        self.async_queue_size_bytes.fetch_add(delta, Ordering::Relaxed);
    }
    pub fn async_queue_size_bytes(&self) -> i64 {
        self.async_queue_size_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_size_accounting() {
        let stats = ConnectionStats::new();
        stats.adjust_async_queue_size(100);
        stats.adjust_async_queue_size(32);
        stats.adjust_async_queue_size(-100);
        assert_eq!(stats.async_queue_size_bytes(), 32);
        stats.adjust_async_queue_size(-32);
        assert_eq!(stats.async_queue_size_bytes(), 0);
    }
}
