//! Port allocation for parallel test workers.
//!
//! Each worker claims a distinct port from a configurable range by taking
//! an advisory file lock named after the port, then binding it. Workers in
//! other processes contend on the same lock files, so no two claim the
//! same port. When the whole range is busy the caller falls back to an
//! OS-assigned port.

use std::{
    fs::{self, File, OpenOptions},
    io,
    net::{Ipv4Addr, TcpListener},
    ops::Range,
    path::PathBuf,
};

use fs2::FileExt;

const DEFAULT_RANGE: Range<u16> = 42000..42200;

/// Claims free ports under an advisory file lock.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    lock_dir: PathBuf,
    range: Range<u16>,
}

/// A claimed port. The lock file stays held for the lease's lifetime.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    _lock: File,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE, std::env::temp_dir().join("cysim-ports"))
    }
}

impl PortAllocator {
    pub fn new(range: Range<u16>, lock_dir: PathBuf) -> Self {
        Self { lock_dir, range }
    }

    /// Claim a free port from the range and bind it, so the caller holds
    /// both the lock and the socket with no window in between.
    pub fn reserve_listener(&self) -> io::Result<(PortLease, TcpListener)> {
        fs::create_dir_all(&self.lock_dir)?;
        for port in self.range.clone() {
            let lock_path = self.lock_dir.join(format!("port-{port}.lock"));
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            if file.try_lock_exclusive().is_err() {
                continue; // another worker holds this port
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    return Ok((PortLease { port, _lock: file }, listener));
                }
                // locked but bound by something outside the allocator
                Err(_) => continue,
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free port in the allocator range",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(dir: &tempfile::TempDir) -> PortAllocator {
        PortAllocator::new(43300..43310, dir.path().to_path_buf())
    }

    #[test]
    fn two_reservations_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let (lease_a, _listener_a) = allocator(&dir).reserve_listener().unwrap();
        let (lease_b, _listener_b) = allocator(&dir).reserve_listener().unwrap();
        assert_ne!(lease_a.port(), lease_b.port());
    }

    #[test]
    fn released_ports_can_be_claimed_again() {
        let dir = tempfile::tempdir().unwrap();
        let first = allocator(&dir).reserve_listener().unwrap().0.port();
        // lease and listener dropped; the port is claimable again
        let second = allocator(&dir).reserve_listener().unwrap().0.port();
        assert_eq!(first, second);
    }

    #[test]
    fn an_exhausted_range_reports_addr_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let narrow = PortAllocator::new(43320..43321, dir.path().to_path_buf());
        let _held = narrow.reserve_listener().unwrap();
        let err = narrow.reserve_listener().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
