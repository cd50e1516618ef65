//! A Cync device simulator, the test harness of cync-lan.
//!
//! The simulator accepts TCP connections and speaks the real protocol with
//! the same codec and framer production uses: 0x23 hellos get 0x28, 0x73
//! commands mutate a [`DeviceState`] and get 0x7B, status broadcasts get
//! 0x88, heartbeats get 0xD8. Every data-plane response can be delayed,
//! dropped, duplicated, reordered or corrupted through [`ChaosConfig`],
//! with a deterministic drop pattern for reproducible CI failures.

pub mod chaos;
pub mod device;
pub mod port;
pub mod server;

pub use chaos::{ChaosConfig, ChaosConfigBuilder};
pub use device::DeviceState;
pub use port::{PortAllocator, PortLease};
pub use server::DeviceSimulator;
