//! Relay port allocation
//!
//! Fresh ports are handed out monotonically from `start_port + 1` up to
//! `start_port + max_ports`. Ports given back through [`PortAllocator::release`]
//! are reused lowest-first before the counter advances. The allocator is not
//! synchronized; [`crate::session::SessionCache`] keeps it behind a mutex.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::config::PortConfig;
use crate::error::{RelayError, Result};

#[derive(Debug)]
pub struct PortAllocator {
    start_port: u16,
    max_ports: u16,
    /// Offset of the last fresh port handed out
    issued: u16,
    reuse_released: bool,
    released: BinaryHeap<Reverse<u16>>,
    /// Mirror of `released` to reject double releases
    pooled: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(start_port: u16, max_ports: u16) -> Self {
        Self {
            start_port,
            max_ports,
            issued: 0,
            reuse_released: true,
            released: BinaryHeap::new(),
            pooled: HashSet::new(),
        }
    }

    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.start_port, config.max_ports).with_reuse(config.reuse_released)
    }

    /// Enable or disable reuse of released ports
    pub fn with_reuse(mut self, reuse_released: bool) -> Self {
        self.reuse_released = reuse_released;
        self
    }

    /// Allocate the next port
    pub fn allocate(&mut self) -> Result<u16> {
        if let Some(Reverse(port)) = self.released.pop() {
            self.pooled.remove(&port);
            return Ok(port);
        }

        if self.issued >= self.max_ports {
            return Err(RelayError::PortsExhausted {
                start_port: self.start_port,
                last_port: self.last_port(),
            });
        }

        self.issued += 1;
        Ok(self.start_port + self.issued)
    }

    /// Return a port whose relay is confirmed gone
    ///
    /// Ports outside the issued range are ignored, as are releases while
    /// reuse is disabled.
    pub fn release(&mut self, port: u16) {
        if !self.reuse_released || !self.was_issued(port) {
            return;
        }
        if self.pooled.insert(port) {
            self.released.push(Reverse(port));
        }
    }

    /// Ports that can still be allocated
    pub fn available(&self) -> usize {
        (self.max_ports - self.issued) as usize + self.released.len()
    }

    fn was_issued(&self, port: u16) -> bool {
        port > self.start_port && port <= self.start_port + self.issued
    }

    fn last_port(&self) -> u16 {
        self.start_port.saturating_add(self.max_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_from_start_plus_one() {
        let mut ports = PortAllocator::new(6000, 1000);
        assert_eq!(ports.allocate().unwrap(), 6001);
        assert_eq!(ports.allocate().unwrap(), 6002);
        assert_eq!(ports.allocate().unwrap(), 6003);
    }

    #[test]
    fn test_exhaustion_after_max_ports() {
        let mut ports = PortAllocator::new(6000, 3);
        let issued: Vec<u16> = (0..3).map(|_| ports.allocate().unwrap()).collect();
        assert_eq!(issued, vec![6001, 6002, 6003]);

        match ports.allocate() {
            Err(RelayError::PortsExhausted {
                start_port,
                last_port,
            }) => {
                assert_eq!(start_port, 6000);
                assert_eq!(last_port, 6003);
            }
            other => panic!("Expected PortsExhausted, got {:?}", other),
        }
        // Still exhausted, no wrap-around
        assert!(ports.allocate().is_err());
        assert_eq!(ports.available(), 0);
    }

    #[test]
    fn test_released_ports_reused_lowest_first() {
        let mut ports = PortAllocator::new(6000, 10);
        for _ in 0..4 {
            ports.allocate().unwrap();
        }
        ports.release(6003);
        ports.release(6002);
        ports.release(6002);

        assert_eq!(ports.allocate().unwrap(), 6002);
        assert_eq!(ports.allocate().unwrap(), 6003);
        assert_eq!(ports.allocate().unwrap(), 6005);
    }

    #[test]
    fn test_release_ignores_unissued_ports() {
        let mut ports = PortAllocator::new(6000, 10);
        ports.allocate().unwrap();
        ports.release(6000);
        ports.release(6009);
        assert_eq!(ports.allocate().unwrap(), 6002);
    }

    #[test]
    fn test_release_reopens_exhausted_range() {
        let mut ports = PortAllocator::new(6000, 1);
        assert_eq!(ports.allocate().unwrap(), 6001);
        assert!(ports.allocate().is_err());

        ports.release(6001);
        assert_eq!(ports.available(), 1);
        assert_eq!(ports.allocate().unwrap(), 6001);
    }

    #[test]
    fn test_reuse_disabled() {
        let mut ports = PortAllocator::new(6000, 2).with_reuse(false);
        assert_eq!(ports.allocate().unwrap(), 6001);
        ports.release(6001);
        assert_eq!(ports.allocate().unwrap(), 6002);
        assert!(ports.allocate().is_err());
    }
}
