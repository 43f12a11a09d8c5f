//! Loopback port allocation for unit HTTP endpoints.

use std::collections::HashSet;
use std::net::TcpListener;

use appvisor_common::{Error, Result};

/// Default range handed to units as their private endpoint.
pub const PRIVATE_PORT_RANGE: PortRange = PortRange::new(52521, 52570);

/// Default range handed to units as their public endpoint.
pub const PUBLIC_PORT_RANGE: PortRange = PortRange::new(52571, 52620);

/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

/// Find a free port in the range, skipping `reserved` ones already handed
/// to other units, then probe-binding the rest.
///
/// The probe listener is dropped before returning, so the OS-level check
/// is advisory; the unit itself binds the port when it starts.
pub fn allocate_port(range: PortRange, reserved: &HashSet<u16>) -> Result<u16> {
    for port in range.start..=range.end {
        if reserved.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::no_free_port(range.start, range.end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_the_range() {
        let range = PortRange::new(52521, 52570);
        let port = allocate_port(range, &HashSet::new()).unwrap();
        assert!((range.start..=range.end).contains(&port));
    }

    #[test]
    fn skips_reserved_ports() {
        let range = PortRange::new(52521, 52570);
        let first = allocate_port(range, &HashSet::new()).unwrap();
        let second = allocate_port(range, &HashSet::from([first])).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn skips_occupied_ports() {
        let range = PortRange::new(52521, 52570);
        let first = allocate_port(range, &HashSet::new()).unwrap();
        let _holder = TcpListener::bind(("127.0.0.1", first)).unwrap();
        let second = allocate_port(range, &HashSet::new()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let range = PortRange::new(52521, 52522);
        let reserved = HashSet::from([52521, 52522]);
        assert!(matches!(
            allocate_port(range, &reserved),
            Err(Error::NoFreePort { .. })
        ));
    }
}
