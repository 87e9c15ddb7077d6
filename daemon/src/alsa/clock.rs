//! Lock-free clock observations shared between loops
//!
//! The data loop publishes after every wakeup; followers (a slaved device,
//! the graph transport) read without taking locks.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClockCell {
    nsec: AtomicU64,
    rate: AtomicU32,
    position: AtomicU64,
    delay: AtomicI64,
    /// f64 bit pattern of the rate ratio estimate
    rate_diff: AtomicU64,
}

impl ClockCell {
    pub fn new() -> Self {
        let cell = Self::default();
        cell.rate_diff.store(1.0f64.to_bits(), Ordering::Relaxed);
        cell
    }

    pub fn publish(&self, nsec: u64, rate: u32, position: u64, delay: i64, rate_diff: f64) {
        self.nsec.store(nsec, Ordering::Relaxed);
        self.rate.store(rate, Ordering::Relaxed);
        self.position.store(position, Ordering::Relaxed);
        self.delay.store(delay, Ordering::Relaxed);
        self.rate_diff.store(rate_diff.to_bits(), Ordering::Release);
    }

    pub fn nsec(&self) -> u64 {
        self.nsec.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn delay(&self) -> i64 {
        self.delay.load(Ordering::Relaxed)
    }

    pub fn rate_diff(&self) -> f64 {
        f64::from_bits(self.rate_diff.load(Ordering::Acquire))
    }
}

/// Transport a slaved device follows: the driving quantum plus the master
/// clock observations
#[derive(Debug, Default)]
pub struct TransportCell {
    size: AtomicU32,
    pub clock: ClockCell,
}

impl TransportCell {
    pub fn new(size: u32) -> Self {
        TransportCell {
            size: AtomicU32::new(size),
            clock: ClockCell::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_observe() {
        let cell = ClockCell::new();
        assert_eq!(cell.rate_diff(), 1.0);
        cell.publish(123, 48000, 4096, -1024, 1.0002);
        assert_eq!(cell.nsec(), 123);
        assert_eq!(cell.rate(), 48000);
        assert_eq!(cell.position(), 4096);
        assert_eq!(cell.delay(), -1024);
        assert!((cell.rate_diff() - 1.0002).abs() < 1e-12);
    }
}
