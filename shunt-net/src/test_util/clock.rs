//! A hand-cranked time source for exercising the cap timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dataplane::queue::TickSource;

pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ns: AtomicU64::new(0),
        })
    }

    pub fn advance_ms(&self, ms: u64) {
        self.ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, ns: u64) {
        self.ns.fetch_add(ns, Ordering::SeqCst);
    }
}

impl TickSource for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}
