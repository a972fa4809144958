//! Broker reachability status shared between the supervisor and coordinator
//!
//! The core only needs a get/set pair. Any backing store works as long as both
//! operations are safe to call from several tasks at once.

use std::sync::atomic::{AtomicBool, Ordering};

/// Capability exposing the "broker reachable" flag
pub trait HealthSink: Send + Sync {
    /// Current broker reachability
    fn status(&self) -> bool;

    /// Record broker reachability
    fn set_status(&self, reachable: bool);
}

/// In-memory health flag, unreachable until told otherwise
#[derive(Debug, Default)]
pub struct SharedHealth {
    reachable: AtomicBool,
}

impl SharedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }
}

impl HealthSink for SharedHealth {
    fn status(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn set_status(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}
