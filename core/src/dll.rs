//! Second-order delay-locked loop
//!
//! The I/O loop sets its timer in absolute monotonic time. Each wakeup
//! observes when the device clock says the wakeup should have happened; the
//! loop filter turns that noisy observation into a smoothed forward time
//! that tracks the true sample rate without oscillating.

use std::f64::consts::{PI, SQRT_2};

/// Bandwidth used while locking onto the clock
pub const DLL_BW_MAX: f64 = 0.128;
/// Bandwidth used once locked, for low jitter
pub const DLL_BW_MIN: f64 = 0.016;
/// Seconds of smoothed time after which the bandwidth is lowered
pub const DLL_BW_PERIOD: f64 = 0.5;

/// Loop state. `dt` is the estimated ratio between the observed clock and
/// the nominal one, clamped to [0.95, 1.05] after every step.
#[derive(Debug, Clone, Copy)]
pub struct Dll {
    /// First observed time, reference for the bandwidth decay
    pub base: f64,
    /// Current loop bandwidth
    pub bw: f64,
    /// Clock rate ratio estimate
    pub dt: f64,
    t1: f64,
    e2: f64,
    primed: bool,
}

impl Dll {
    pub fn new(bw: f64) -> Self {
        Self {
            base: 0.0,
            bw,
            dt: 1.0,
            t1: 0.0,
            e2: 0.0,
            primed: false,
        }
    }

    /// Resets the filter, typically after an xrun, and sets the bandwidth
    pub fn init(&mut self, bw: f64) {
        *self = Self::new(bw);
    }

    pub fn set_bandwidth(&mut self, bw: f64) {
        self.bw = bw;
    }

    /// Feeds one observation `t` (seconds) covering `window` seconds of
    /// nominal time, returning the smoothed time for the next wakeup.
    pub fn update(&mut self, t: f64, window: f64) -> f64 {
        if !self.primed {
            self.primed = true;
            self.base = t;
            self.e2 = window;
            self.t1 = t + window;
            self.dt = 1.0;
            return self.t1;
        }

        let err = t - self.t1;
        let w = 2.0 * PI * self.bw;
        self.t1 += self.e2 + SQRT_2 * w * err;
        self.e2 += w * w * err;
        self.dt = (self.e2 / window).clamp(0.95, 1.05);
        self.t1
    }
}
