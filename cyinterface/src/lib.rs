//! The IO edge of cync-lan.
//!
//! Two pieces sit between the raw TCP stream and the reliable transport:
//! the [`framer::StreamFramer`], which turns arbitrary read boundaries into
//! complete packets without ever letting a hostile peer grow the buffer or
//! force quadratic rescans, and the [`queue::BoundedQueue`], the
//! backpressure surface between the transport's receive path and the
//! application.

pub mod error;
pub mod framer;
pub mod queue;

pub use error::{PacketFramingError, QueueFullError};
pub use framer::StreamFramer;
pub use queue::{BoundedQueue, OverflowPolicy, PutResult};
