//! Process-wide clock abstraction.
//!
//! Business logic never calls `Utc::now()`/`Instant::now()` directly; it
//! takes `Arc<dyn Clock>` so tests can drive idle-timeout and restart-budget
//! windows deterministically instead of sleeping real wall time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall-clock time, used by the binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests can advance manually.
#[derive(Debug)]
pub struct VirtualClock {
    now: RwLock<DateTime<Utc>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(VirtualClock {
            now: RwLock::new(start),
        })
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
