//! Aggregate bandwidth throttle shared by all reader threads.
//!
//! Each reader calls [`Throttle::request`] before issuing an I/O cycle. Under
//! a single mutex the throttle measures the time since the previous request
//! and sleeps the difference if the readers are running ahead of the target
//! rate. The mutex provides fairness across readers; only the aggregate rate
//! is bounded, not per-reader bandwidth.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct Throttle {
    mibps: u64,
    inner: Mutex<Instant>,
}

impl Throttle {
    /// Target rate in MiB/s; 0 disables throttling.
    pub fn new(mibps: u64) -> Self {
        Throttle {
            mibps,
            inner: Mutex::new(Instant::now()),
        }
    }

    /// Account for a read of `kib` KiB, sleeping if the previous request
    /// completed faster than the target rate allows.
    pub fn request(&self, kib: u64) {
        if self.mibps == 0 {
            return;
        }
        let mut last = self.inner.lock().unwrap();
        let elapsed = last.elapsed();
        // minimum duration for kib KiB at mibps MiB/s
        let need = Duration::from_micros(1024 * kib / self.mibps);
        if need > elapsed {
            std::thread::sleep(need - elapsed);
        }
        *last = Instant::now();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_target_never_sleeps() {
        let t = Throttle::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            t.request(1024);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn paced_requests_take_proportional_time() {
        // 100 MiB/s, 10 requests of 1 MiB => at least ~90ms in total
        // (the first request rides on the constructor timestamp).
        let t = Throttle::new(100);
        let start = Instant::now();
        for _ in 0..10 {
            t.request(1024);
        }
        assert!(
            start.elapsed() >= Duration::from_millis(80),
            "throttle finished too fast: {:?}",
            start.elapsed()
        );
    }
}
