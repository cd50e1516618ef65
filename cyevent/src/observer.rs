//! Passive packet observers.
//!
//! A capture tool or protocol analyzer can watch every raw packet a
//! transport moves, in both directions, without any ability to break the
//! pipeline: observer panics are caught, counted and logged, never
//! propagated.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Which way a packet moved relative to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// A passive watcher of one transport's traffic and lifecycle.
pub trait PacketObserver: Send + Sync {
    fn on_packet_received(&self, direction: Direction, raw: &[u8], connection_id: &str);
    fn on_connection_established(&self, connection_id: &str);
    fn on_connection_closed(&self, connection_id: &str);
}

/// The observer set a transport notifies.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<ObserverSet>,
}

#[derive(Default)]
struct ObserverSet {
    observers: Vec<Arc<dyn PacketObserver>>,
    panics: AtomicU64,
}

impl Observers {
    pub fn new(observers: Vec<Arc<dyn PacketObserver>>) -> Self {
        Self {
            inner: Arc::new(ObserverSet {
                observers,
                panics: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.observers.is_empty()
    }

    /// How many observer invocations have panicked so far.
    pub fn panic_count(&self) -> u64 {
        self.inner.panics.load(Ordering::Relaxed)
    }

    pub fn notify_packet(&self, direction: Direction, raw: &[u8], connection_id: &str) {
        for observer in &self.inner.observers {
            self.shielded(|| observer.on_packet_received(direction, raw, connection_id));
        }
    }

    pub fn notify_established(&self, connection_id: &str) {
        for observer in &self.inner.observers {
            self.shielded(|| observer.on_connection_established(connection_id));
        }
    }

    pub fn notify_closed(&self, connection_id: &str) {
        for observer in &self.inner.observers {
            self.shielded(|| observer.on_connection_closed(connection_id));
        }
    }

    fn shielded(&self, call: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(call)).is_err() {
            self.inner.panics.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("packet observer panicked, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;

    impl PacketObserver for Panicking {
        fn on_packet_received(&self, _: Direction, _: &[u8], _: &str) {
            panic!("observer bug");
        }
        fn on_connection_established(&self, _: &str) {}
        fn on_connection_closed(&self, _: &str) {}
    }

    struct Recording(std::sync::Mutex<Vec<usize>>);

    impl PacketObserver for Recording {
        fn on_packet_received(&self, _: Direction, raw: &[u8], _: &str) {
            self.0.lock().unwrap().push(raw.len());
        }
        fn on_connection_established(&self, _: &str) {}
        fn on_connection_closed(&self, _: &str) {}
    }

    #[test]
    fn a_panicking_observer_cannot_break_the_pipeline() {
        let recording = Arc::new(Recording(std::sync::Mutex::new(Vec::new())));
        let observers = Observers::new(vec![Arc::new(Panicking), recording.clone()]);

        observers.notify_packet(Direction::Inbound, &[1, 2, 3], "conn-1");
        observers.notify_packet(Direction::Outbound, &[4, 5], "conn-1");

        assert_eq!(observers.panic_count(), 2);
        assert_eq!(*recording.0.lock().unwrap(), vec![3, 2]);
    }
}
