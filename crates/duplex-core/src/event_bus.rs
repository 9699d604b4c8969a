use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

/// A background signal the conscious path may choose to weave into speech.
#[derive(Debug, Clone)]
pub struct AttentionEvent {
    pub kind: String,
    pub source: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl AttentionEvent {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn backpressure_rejection(source: impl Into<String>, category: &str) -> Self {
        Self::new(
            "backpressure_rejection",
            source,
            serde_json::json!({ "category": category }),
        )
    }

    pub fn pattern_detected(source: impl Into<String>) -> Self {
        Self::new("pattern_detected", source, Value::Null)
    }

    pub fn world_update(source: impl Into<String>, data: Value) -> Self {
        Self::new("world_update", source, data)
    }

    /// The event's own carried message, if it has one under `data.message`.
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventBusStats {
    pub queued: usize,
    pub dropped: u64,
    pub capacity: usize,
}

/// A bounded, non-blocking queue decoupling background producers from the
/// conscious response path. On overflow the *new* event is dropped — the
/// queue never evicts what is already buffered — and a monotonic counter
/// tracks how many events were lost.
pub struct AttentionEventBus {
    capacity: usize,
    queue: Mutex<VecDeque<AttentionEvent>>,
    dropped: AtomicU64,
}

impl AttentionEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publishes an event. Never blocks; drops the event and increments
    /// `dropped` if the bus is at capacity.
    pub fn publish(&self, event: AttentionEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %event.kind, "attention event dropped, bus at capacity");
            return;
        }
        queue.push_back(event);
    }

    /// Drains up to `max_items` events, oldest first, without blocking.
    pub fn drain(&self, max_items: usize) -> Vec<AttentionEvent> {
        let mut queue = self.queue.lock();
        let n = max_items.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            queued: self.queue.lock().len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_drain_round_trip_in_fifo_order() {
        let bus = AttentionEventBus::new(10);
        bus.publish(AttentionEvent::pattern_detected("watcher"));
        bus.publish(AttentionEvent::world_update("watcher", Value::Null));
        let drained = bus.drain(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, "pattern_detected");
        assert_eq!(drained[1].kind, "world_update");
    }

    #[test]
    fn drain_respects_max_items() {
        let bus = AttentionEventBus::new(10);
        for _ in 0..5 {
            bus.publish(AttentionEvent::pattern_detected("watcher"));
        }
        let drained = bus.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(bus.stats().queued, 3);
    }

    #[test]
    fn overflow_drops_newest_and_increments_counter() {
        let bus = AttentionEventBus::new(2);
        bus.publish(AttentionEvent::pattern_detected("a"));
        bus.publish(AttentionEvent::pattern_detected("b"));
        bus.publish(AttentionEvent::pattern_detected("c"));

        let stats = bus.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);

        let drained = bus.drain(10);
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn message_reads_carried_data_field() {
        let event = AttentionEvent::new(
            "backpressure_rejection",
            "task_registry",
            serde_json::json!({ "message": "busy" }),
        );
        assert_eq!(event.message(), Some("busy"));
        assert_eq!(AttentionEvent::pattern_detected("x").message(), None);
    }
}
