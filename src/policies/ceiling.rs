//! # Restart ceiling.
//!
//! A slot may be restarted at most `max_restarts` times within any `window`.
//! One more death inside the window quarantines the slot: it is not respawned
//! again until an operator calls [`Supervisor::reset`](crate::Supervisor::reset).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window restart limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartCeiling {
    /// Restarts allowed inside `window`. `0` quarantines on the first death.
    pub max_restarts: u32,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for RestartCeiling {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl RestartCeiling {
    /// Ceiling that never quarantines.
    pub fn unlimited() -> Self {
        Self {
            max_restarts: u32::MAX,
            window: Duration::ZERO,
        }
    }
}

/// Death timestamps of one slot, oldest first.
#[derive(Debug, Default)]
pub(crate) struct RestartHistory {
    deaths: VecDeque<Instant>,
}

impl RestartHistory {
    /// Records a death at `now`, forgets deaths older than the window and returns
    /// `true` when the slot has gone over its ceiling.
    pub(crate) fn record(&mut self, now: Instant, ceiling: &RestartCeiling) -> bool {
        self.deaths.push_back(now);
        while let Some(oldest) = self.deaths.front() {
            if now.saturating_duration_since(*oldest) > ceiling.window {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
        self.deaths.len() as u64 > u64::from(ceiling.max_restarts)
    }

    pub(crate) fn clear(&mut self) {
        self.deaths.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.deaths.len()
    }
}
