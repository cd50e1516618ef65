//! The one-transport-per-device registry.
//!
//! Sequential msg id generation is only collision-free if a single
//! transport instance owns a device's msg id namespace, so the process
//! holds at most one live transport per `device_id`. The slot is claimed on
//! `connect` and released by the guard on every exit path, including drop.

use std::sync::OnceLock;

use dashmap::{DashMap, Entry};
use uuid::Uuid;

use crate::error::CyncConnectionError;

fn registry() -> &'static DashMap<String, Uuid> {
    static REGISTRY: OnceLock<DashMap<String, Uuid>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Holds one device's registry slot; releasing is dropping.
#[derive(Debug)]
pub struct RegistryGuard {
    device_id: String,
    instance: Uuid,
}

impl RegistryGuard {
    /// Claim the slot for `device_id` on behalf of transport `instance`.
    pub fn claim(device_id: &str, instance: Uuid) -> Result<Self, CyncConnectionError> {
        match registry().entry(device_id.to_owned()) {
            Entry::Occupied(_) => Err(CyncConnectionError::ParallelConnection {
                device_id: device_id.to_owned(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(Self {
                    device_id: device_id.to_owned(),
                    instance,
                })
            }
        }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        registry().remove_if(&self.device_id, |_, instance| *instance == self.instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_while_live_is_refused() {
        let first = RegistryGuard::claim("registry-test-a", Uuid::now_v7()).unwrap();
        let err = RegistryGuard::claim("registry-test-a", Uuid::now_v7()).unwrap_err();
        assert_eq!(err.reason(), "parallel_connection");
        drop(first);
        // released slot can be claimed again
        RegistryGuard::claim("registry-test-a", Uuid::now_v7()).unwrap();
    }

    #[test]
    fn distinct_devices_do_not_contend() {
        let _a = RegistryGuard::claim("registry-test-b", Uuid::now_v7()).unwrap();
        let _b = RegistryGuard::claim("registry-test-c", Uuid::now_v7()).unwrap();
    }
}
