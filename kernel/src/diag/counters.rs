//! Process-wide counter registry.
//!
//! Each counter is a named static. `snapshot()` walks the fixed registry so
//! a debug shell or a test can read every counter at once.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

macro_rules! kcounter {
    ($ident:ident, $name:expr) => {
        pub static $ident: Counter = Counter::new($name);
    };
}

// Channel queue high-water marks, recorded when a channel endpoint is destroyed.
kcounter!(CHANNEL_MSG_0_1, "channel.messages.0_1");
kcounter!(CHANNEL_MSG_2_4, "channel.messages.2_4");
kcounter!(CHANNEL_MSG_5_16, "channel.messages.5_16");
kcounter!(CHANNEL_MSG_17_64, "channel.messages.17_64");
kcounter!(CHANNEL_MSG_65_256, "channel.messages.65_256");
kcounter!(CHANNEL_MSG_257_INF, "channel.messages.257_inf");

kcounter!(PAGER_TOTAL_REQUESTS, "dispatcher.pager.total_requests");
kcounter!(PAGER_SUCCEEDED_REQUESTS, "dispatcher.pager.succeeded_requests");
kcounter!(PAGER_FAILED_REQUESTS, "dispatcher.pager.failed_requests");
kcounter!(PAGER_TIMED_OUT_REQUESTS, "dispatcher.pager.timed_out_requests");
kcounter!(PAGER_OVERTIME_WAITS, "dispatcher.pager.overtime_waits");

static REGISTRY: [&Counter; 11] = [
    &CHANNEL_MSG_0_1,
    &CHANNEL_MSG_2_4,
    &CHANNEL_MSG_5_16,
    &CHANNEL_MSG_17_64,
    &CHANNEL_MSG_65_256,
    &CHANNEL_MSG_257_INF,
    &PAGER_TOTAL_REQUESTS,
    &PAGER_SUCCEEDED_REQUESTS,
    &PAGER_FAILED_REQUESTS,
    &PAGER_TIMED_OUT_REQUESTS,
    &PAGER_OVERTIME_WAITS,
];

/// Bucket a channel's maximum observed queue depth.
pub fn record_channel_depth(max_depth: usize) {
    let counter = match max_depth {
        0..=1 => &CHANNEL_MSG_0_1,
        2..=4 => &CHANNEL_MSG_2_4,
        5..=16 => &CHANNEL_MSG_5_16,
        17..=64 => &CHANNEL_MSG_17_64,
        65..=256 => &CHANNEL_MSG_65_256,
        _ => &CHANNEL_MSG_257_INF,
    };
    counter.add(1);
}

pub fn snapshot() -> Vec<(&'static str, u64)> {
    REGISTRY.iter().map(|c| (c.name(), c.value())).collect()
}

/// Look a counter up by its exported name.
pub fn value_of(name: &str) -> Option<u64> {
    REGISTRY.iter().find(|c| c.name() == name).map(|c| c.value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_buckets() {
        let before_small = CHANNEL_MSG_2_4.value();
        let before_big = CHANNEL_MSG_257_INF.value();
        record_channel_depth(3);
        record_channel_depth(4);
        record_channel_depth(100_000);
        assert!(CHANNEL_MSG_2_4.value() >= before_small + 2);
        assert!(CHANNEL_MSG_257_INF.value() >= before_big + 1);
    }

    #[test]
    fn snapshot_lists_every_counter() {
        let snap = snapshot();
        assert_eq!(snap.len(), REGISTRY.len());
        assert!(snap.iter().any(|(name, _)| *name == "dispatcher.pager.overtime_waits"));
        assert!(value_of("channel.messages.0_1").is_some());
        assert!(value_of("no.such.counter").is_none());
    }
}
