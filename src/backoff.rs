//! Spin-then-sleep backoff used at every contention yield site.

use std::time::Duration;

/// Starts by spinning, then sleeps 100us doubling up to the cap.
pub struct Backoff {
    spins: u32,
    sleep_us: u64,
    cap_us: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Backoff {
    pub fn new(cap_us: u64) -> Backoff {
        Backoff {
            spins: 0,
            sleep_us: 100,
            cap_us,
        }
    }

    pub fn wait(&mut self) {
        if self.spins < 100 {
            self.spins += 1;
            std::hint::spin_loop();
            if self.spins % 10 == 0 {
                std::thread::yield_now();
            }
            return;
        }
        std::thread::sleep(Duration::from_micros(self.sleep_us));
        self.sleep_us = (self.sleep_us * 2).min(self.cap_us);
    }
}
