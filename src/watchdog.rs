//! Watchdog task: the one place recovery decisions are made.
//!
//! A single ticking task per steward. Each tick it checks worker liveness,
//! drains untracked device faults, and rebuilds the worker when the task
//! died or the port went away. Ticks that pile up behind a slow rebuild are
//! skipped, so at most one recovery runs per detection.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::steward::StewardInner;

/// Spawn the watchdog. It holds only a weak reference, so it winds down on
/// its own once the steward is dropped.
pub(crate) fn spawn(inner: Weak<StewardInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            inner.watchdog_tick().await;
        }
        tracing::debug!("watchdog wound down");
    })
}
