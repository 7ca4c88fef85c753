//! RTP/RTCP port pool
//!
//! The pool hands out numbered slots. Slot `id` owns the port pair
//!
//! ```text
//! rtp  = start + 2 * id
//! rtcp = rtp + 1
//! ```
//!
//! and a port maps back to its slot with `(port - start) / 2`. Both
//! directions go through [`PortAllocator::suite_for_slot`] and
//! [`PortAllocator::slot_for_port`] so they cannot drift apart.
//!
//! Allocation is round-robin: the scan starts after the most recently
//! allocated slot, which spreads sessions over the range instead of
//! immediately reusing a just-released pair.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PortRangeConfig;
use crate::error::{Error, Result};

/// Ports owned by one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortSuite {
    pub slot: usize,
    pub rtp: u16,
    pub rtcp: u16,
}

struct PoolState {
    used: Vec<bool>,
    in_use: usize,
    last_allocated: Option<usize>,
}

/// Fixed-capacity pool of port pairs
pub struct PortAllocator {
    start: u16,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(range: &PortRangeConfig) -> Self {
        let capacity = range.capacity();
        debug!(start = range.start, end = range.end, capacity, "Port pool initialized");
        Self {
            start: range.start,
            capacity,
            state: Mutex::new(PoolState {
                used: vec![false; capacity],
                in_use: 0,
                last_allocated: None,
            }),
        }
    }

    /// Reserve the next free port pair
    pub fn allot(&self) -> Result<PortSuite> {
        let mut state = self.state.lock();

        if state.in_use >= self.capacity {
            return Err(Error::Capacity(self.capacity));
        }

        // in_use < capacity guarantees a free slot within one lap
        let first = state.last_allocated.map_or(0, |last| (last + 1) % self.capacity);
        let slot = (0..self.capacity)
            .map(|offset| (first + offset) % self.capacity)
            .find(|&slot| !state.used[slot])
            .ok_or(Error::Capacity(self.capacity))?;

        state.used[slot] = true;
        state.in_use += 1;
        state.last_allocated = Some(slot);

        Ok(self.suite_for_slot(slot))
    }

    /// Return the pair whose RTP port is `rtp_port` to the pool.
    ///
    /// Returns false for ports that are not the RTP port of a currently
    /// allocated slot.
    pub fn release(&self, rtp_port: u16) -> bool {
        let Some(slot) = self.slot_for_port(rtp_port) else {
            warn!(rtp_port, "Released port is not an RTP port of this pool");
            return false;
        };

        let mut state = self.state.lock();
        if !state.used[slot] {
            warn!(rtp_port, slot, "Released port was not allocated");
            return false;
        }
        state.used[slot] = false;
        state.in_use -= 1;
        true
    }

    /// Number of slots currently held
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn suite_for_slot(&self, slot: usize) -> PortSuite {
        // slot < capacity <= (u16::MAX - start) / 2 keeps this in range
        let rtp = self.start + (slot as u16) * 2;
        PortSuite {
            slot,
            rtp,
            rtcp: rtp + 1,
        }
    }

    /// Inverse of [`suite_for_slot`](Self::suite_for_slot) for RTP ports
    #[must_use]
    pub fn slot_for_port(&self, rtp_port: u16) -> Option<usize> {
        let offset = rtp_port.checked_sub(self.start)?;
        if offset % 2 != 0 {
            return None;
        }
        let slot = usize::from(offset / 2);
        (slot < self.capacity).then_some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(&PortRangeConfig { start, end })
    }

    #[test]
    fn test_allocations_are_unique_and_in_range() {
        let ports = pool(10000, 10020);
        let capacity = ports.capacity();
        assert_eq!(capacity, 10);

        let mut seen = HashSet::new();
        for _ in 0..capacity {
            let suite = ports.allot().unwrap();
            assert!(suite.rtp >= 10000 && suite.rtcp < 10000 + 2 * capacity as u16);
            assert_eq!(suite.rtcp, suite.rtp + 1);
            assert!(seen.insert((suite.rtp, suite.rtcp)));
        }

        assert!(matches!(ports.allot(), Err(Error::Capacity(10))));
        assert_eq!(ports.in_use(), 10);
    }

    #[test]
    fn test_released_pair_is_reused() {
        let ports = pool(10000, 10004);
        let a = ports.allot().unwrap();
        let _b = ports.allot().unwrap();
        assert!(ports.allot().is_err());

        assert!(ports.release(a.rtp));
        assert_eq!(ports.allot().unwrap(), a);
    }

    #[test]
    fn test_round_robin_skips_recently_released() {
        let ports = pool(10000, 10006);
        let a = ports.allot().unwrap();
        assert!(ports.release(a.rtp));

        // slot 0 is free again, but the scan continues after it
        let b = ports.allot().unwrap();
        assert_eq!(b.slot, 1);
        let c = ports.allot().unwrap();
        assert_eq!(c.slot, 2);
        // wraps around to the start
        let d = ports.allot().unwrap();
        assert_eq!(d.slot, 0);
    }

    #[test]
    fn test_release_inverts_allocation_for_every_slot() {
        let ports = pool(20000, 20200);
        for slot in 0..ports.capacity() {
            let suite = ports.suite_for_slot(slot);
            assert_eq!(ports.slot_for_port(suite.rtp), Some(slot));
        }

        let suites: Vec<_> = (0..ports.capacity()).map(|_| ports.allot().unwrap()).collect();
        for suite in &suites {
            assert!(ports.release(suite.rtp));
        }
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn test_release_rejects_foreign_ports() {
        let ports = pool(10000, 10004);
        let suite = ports.allot().unwrap();

        assert!(!ports.release(suite.rtcp));
        assert!(!ports.release(9998));
        assert!(!ports.release(10004));
        // not allocated yet
        assert!(!ports.release(10002));

        assert!(ports.release(suite.rtp));
        // double release
        assert!(!ports.release(suite.rtp));
    }

    #[test]
    fn test_empty_range() {
        let ports = pool(10000, 10001);
        assert_eq!(ports.capacity(), 0);
        assert!(ports.allot().is_err());
    }
}
