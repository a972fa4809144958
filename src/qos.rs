//! Prefetch (QoS) policy applied to every session before consumers attach
//!
//! With a prefetch count greater than zero the broker delivers at most that
//! many unacknowledged messages to consumers on the session. With a prefetch
//! size greater than zero it tries to keep that many bytes of deliveries
//! flushed ahead of acknowledgements. Both limits are ignored for consumers
//! started in no-ack mode.
//!
//! When `global` is true the limits apply to every consumer on every session
//! of the connection, otherwise only to consumers on this session.

use serde::{Deserialize, Serialize};

/// Immutable prefetch configuration. `0` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosPolicy {
    /// Maximum number of unacknowledged deliveries
    #[serde(default)]
    pub prefetch_count: u32,
    /// Maximum number of unacknowledged bytes
    #[serde(default)]
    pub prefetch_size: u32,
    /// Apply to the whole connection instead of this session only
    #[serde(default)]
    pub global: bool,
}

impl QosPolicy {
    pub fn new(prefetch_count: u32, prefetch_size: u32, global: bool) -> Self {
        Self {
            prefetch_count,
            prefetch_size,
            global,
        }
    }

    /// Per-session limit of `count` unacknowledged deliveries
    pub fn prefetch(count: u32) -> Self {
        Self {
            prefetch_count: count,
            ..Self::default()
        }
    }

    /// Resolve an optional caller-supplied policy to the effective one
    pub fn or_default(qos: Option<QosPolicy>) -> Self {
        qos.unwrap_or_default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.prefetch_count == 0 && self.prefetch_size == 0
    }
}
