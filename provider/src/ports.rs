//! Local port allocation from per-platform disjoint ranges, so the Android and
//! Apple services never collide on the same host port.

use std::net::TcpListener;

use crate::{ProviderError, Result};

pub const ANDROID_RANGE: (u16, u16) = (20000, 30000);
pub const APPLE_RANGE: (u16, u16) = (30000, 40000);

/// Hands out unused local TCP ports by linear scan with wraparound.
///
/// Allocation is not reservation-safe: two callers racing on the same
/// allocator range can both be handed a port before either binds it. Callers
/// serialize allocation per supervisor.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    next: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end, next: start }
    }

    pub fn android() -> Self {
        Self::new(ANDROID_RANGE.0, ANDROID_RANGE.1)
    }

    pub fn apple() -> Self {
        Self::new(APPLE_RANGE.0, APPLE_RANGE.1)
    }

    /// Returns the next free port in the range, or `PortsExhausted` after one
    /// full sweep without finding one.
    pub fn get(&mut self) -> Result<u16> {
        let size = u32::from(self.end - self.start) + 1;
        for _ in 0..size {
            let port = self.next;
            self.next = if port >= self.end { self.start } else { port + 1 };
            if Self::is_free(port) {
                return Ok(port);
            }
        }
        Err(ProviderError::PortsExhausted(self.start, self.end))
    }

    // Bind-and-close instead of connect-probing loopback: a port bound on
    // 0.0.0.0 by another process would look free to a loopback connect.
    fn is_free(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scan_wraps_and_skips_bound_ports() {
        let mut alloc = PortAllocator::new(21500, 21504);
        let first = alloc.get().unwrap();
        let _held = TcpListener::bind(("0.0.0.0", first)).unwrap();

        let second = alloc.get().unwrap();
        assert_ne!(first, second);

        // Exhaust the scan again from the top; the held port must be skipped.
        alloc.next = alloc.start;
        let third = alloc.get().unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn exhaustion_reports_after_one_sweep() {
        let mut alloc = PortAllocator::new(21600, 21602);
        let holders: Vec<_> = (21600..=21602)
            .map(|p| TcpListener::bind(("0.0.0.0", p)).unwrap())
            .collect();

        match alloc.get() {
            Err(ProviderError::PortsExhausted(21600, 21602)) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }
        drop(holders);
    }
}
