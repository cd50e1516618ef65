//! Telemetry for the cync-lan core.
//!
//! The core never talks to a metrics exporter or a log shipper directly; it
//! emits through the abstract sinks defined here. Production wires these to
//! whatever exposition the surrounding application runs, tests wire them to
//! the in-memory implementations and assert on the recorded series.

pub mod events;
pub mod metrics;
pub mod observer;

pub use events::{EventSink, JsonLogSink, NoopEventSink, TransportEvent};
pub use metrics::{MemoryMetrics, MetricsSink, NoopMetrics};
pub use observer::{Direction, Observers, PacketObserver};
