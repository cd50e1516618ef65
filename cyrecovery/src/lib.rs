//! Reliable-delivery primitives of the Cync LAN transport.
//!
//! The [`journal::PendingJournal`] tracks every in-flight reliable send and
//! fires its one-shot notifier when the matching ack arrives; the
//! [`dedup::ArcDedupCache`] recognizes retransmitted receptions by content
//! fingerprint; [`backoff::Backoff`] paces retries and reconnections. None
//! of this performs IO; the connection crate drives it.

pub mod backoff;
pub mod dedup;
pub mod journal;

pub use backoff::Backoff;
pub use dedup::{dedup_key, ArcDedupCache, DedupEntry};
pub use journal::{AckClass, PendingJournal};
