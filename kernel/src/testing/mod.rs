//! Host test support
//!
//! Installs a `std::time` backed timer source so deadlines behave like they
//! do on hardware, and provides a few helpers shared by the test modules.

use std::sync::OnceLock;
use std::time::Instant as StdInstant;

use crate::arch::{self, Timer};

struct HostTimer {
    origin: StdInstant,
}

impl Timer for HostTimer {
    fn timer_now(&self) -> u64 {
        // Offset by one so "now" is never the zero instant.
        self.origin.elapsed().as_nanos() as u64 + 1
    }

    fn cpu_relax(&self) {
        std::thread::yield_now();
    }
}

static HOST_TIMER: OnceLock<HostTimer> = OnceLock::new();

/// Idempotent; every test that touches a deadline calls this first.
pub fn init() {
    let timer = HOST_TIMER.get_or_init(|| HostTimer { origin: StdInstant::now() });
    arch::timer::install(timer);
}

/// Spin until `cond` holds, panicking after a generous bound so a broken
/// test fails instead of hanging.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = StdInstant::now();
    while !cond() {
        if start.elapsed() > std::time::Duration::from_secs(10) {
            panic!("timed out waiting for {what}");
        }
        std::thread::yield_now();
    }
}
