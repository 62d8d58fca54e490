//! Respawn policies for supervised worker processes.
//!
//! ## Contents
//! - [`BackoffPolicy`] how long a dead slot waits before it is respawned
//! - [`JitterPolicy`] randomization applied on top of the backoff delay
//! - [`RestartCeiling`] how many restarts a slot may spend within a sliding window
//!   before it is quarantined
//!
//! ## Wiring
//! ```text
//! SupervisorConfig { backoff, reset_after, ceiling }
//!      └─► control loop on process exit:
//!           - history.record(now, ceiling) → Quarantined + PoolDegraded
//!           - backoff.next(consecutive)     → RespawnScheduled after delay
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → base=100ms, factor=2.0, cap=30s, jitter=None.
//! - `RestartCeiling::default()` → 5 restarts per 60s.

mod backoff;
mod ceiling;
mod jitter;

pub use backoff::BackoffPolicy;
pub use ceiling::RestartCeiling;
pub(crate) use ceiling::RestartHistory;
pub use jitter::JitterPolicy;
