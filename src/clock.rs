//! Wall-clock and virtual time.
//!
//! Everything that stamps cache entries or paces a blocking operation asks a
//! [`Clock`] for the time. The real clock follows the system time and sleeps on
//! the tokio timer; the virtual clock is used by dry-run simulations and only
//! ever advances by the *estimated* duration of each blocking operation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Current UNIX time in seconds, with microsecond resolution.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[derive(Clone, Debug, Default)]
pub enum Clock {
    /// System time; waiting really sleeps.
    #[default]
    Real,
    /// Simulated time; waiting advances the counter instantly.
    Virtual(Arc<Mutex<VirtualTime>>),
}

/// Elapsed time is kept apart from the start so that small steps stay exact
/// next to epoch-sized timestamps.
#[derive(Debug, Clone, Copy)]
pub struct VirtualTime {
    /// Virtual time at which the simulation started.
    pub start: f64,
    /// Seconds advanced since `start`.
    pub elapsed: f64,
}

impl Clock {
    /// Virtual clock starting at `start` (usually the real time at fork).
    pub fn virtual_at(start: f64) -> Self {
        Clock::Virtual(Arc::new(Mutex::new(VirtualTime { start, elapsed: 0.0 })))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Clock::Virtual(_))
    }

    /// Current time according to this clock.
    pub fn time(&self) -> f64 {
        match self {
            Clock::Real => now(),
            Clock::Virtual(t) => {
                let t = t.lock();
                t.start + t.elapsed
            }
        }
    }

    /// Seconds elapsed on a virtual clock since it was started (0 for real clocks).
    pub fn elapsed(&self) -> f64 {
        match self {
            Clock::Real => 0.0,
            Clock::Virtual(t) => t.lock().elapsed,
        }
    }

    /// Advance a virtual clock by `seconds`. No-op on the real clock.
    pub fn tick(&self, seconds: f64) {
        if let Clock::Virtual(t) = self {
            if seconds > 0.0 {
                t.lock().elapsed += seconds;
            }
        }
    }

    /// Advance a virtual clock to `until` if that lies in the future.
    pub fn advance_to(&self, until: f64) {
        if let Clock::Virtual(t) = self {
            let mut t = t.lock();
            let target = until - t.start;
            if target > t.elapsed {
                t.elapsed = target;
            }
        }
    }

    /// Wait for `seconds`: sleeps on the real clock, ticks on a virtual one.
    pub async fn sleep(&self, seconds: f64) {
        match self {
            Clock::Real => {
                if seconds > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                }
            }
            Clock::Virtual(_) => self.tick(seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_clock_never_sleeps() {
        let clock = Clock::virtual_at(1000.0);
        let started = std::time::Instant::now();
        clock.sleep(3600.0).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(clock.time(), 4600.0);
        assert_eq!(clock.elapsed(), 3600.0);
    }

    #[test]
    fn test_advance_to_is_monotonic() {
        let clock = Clock::virtual_at(10.0);
        clock.advance_to(15.0);
        clock.advance_to(12.0);
        assert_eq!(clock.time(), 15.0);
    }

    #[test]
    fn test_real_clock_ignores_tick() {
        let clock = Clock::Real;
        let before = clock.time();
        clock.tick(1e6);
        assert!(clock.time() - before < 10.0);
        assert_eq!(clock.elapsed(), 0.0);
    }
}
