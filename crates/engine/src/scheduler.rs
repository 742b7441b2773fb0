//! Periodic scheduler loop.
//!
//! Two states, `Stopped` and `Running`. While running, a tokio task calls
//! [`AutomationEngine::dispatch_due`] every tick until its cancellation token
//! fires. Each due enrollment's pass is its own task, so a tick never waits
//! on a channel call. `start` and `stop` are idempotent.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::PassResult;
use crate::AutomationEngine;

/// Shortest tick the scheduler accepts.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
enum SchedulerState {
    Stopped,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

#[derive(Debug)]
pub struct Scheduler {
    engine: AutomationEngine,
    interval: Duration,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// A scheduler ticking at the engine's configured `tick_interval`.
    pub fn new(engine: AutomationEngine) -> Self {
        let interval = engine.config().tick_interval;
        Self::with_interval(engine, interval)
    }

    /// A scheduler ticking every `interval`; a zero interval is raised to
    /// [`MIN_INTERVAL`].
    pub fn with_interval(engine: AutomationEngine, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!("zero scheduler interval, using {MIN_INTERVAL:?}");
            MIN_INTERVAL
        } else {
            interval
        };
        Self {
            engine,
            interval,
            state: Mutex::new(SchedulerState::Stopped),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), SchedulerState::Running { .. })
    }

    /// Begin scanning. Must be called from within a tokio runtime.
    ///
    /// Returns `false` (and does nothing) if already running.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        if matches!(*state, SchedulerState::Running { .. }) {
            info!("scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scan_loop(self.engine.clone(), self.interval, cancel.clone()));
        *state = SchedulerState::Running { cancel, handle };
        info!(interval = ?self.interval, "scheduler started");
        true
    }

    /// Stop scanning. Passes still in flight are aborted; their enrollments
    /// stay due and are picked up again by the next scheduler.
    ///
    /// Returns `false` if already stopped.
    pub async fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), SchedulerState::Stopped);
        let SchedulerState::Running { cancel, handle } = previous else {
            debug!("scheduler already stopped");
            return false;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("scheduler task ended abnormally: {e}");
        }
        info!("scheduler stopped");
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let SchedulerState::Running { cancel, .. } = &*self.lock() {
            cancel.cancel();
        }
    }
}

async fn scan_loop(engine: AutomationEngine, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes: JoinSet<PassResult> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dispatched = engine.dispatch_due(&mut passes);
                if dispatched > 0 {
                    debug!(dispatched, in_flight = passes.len(), "scan dispatched");
                }
            }
            Some(joined) = passes.join_next(), if !passes.is_empty() => {
                if let Err(e) = joined {
                    error!("enrollment pass ended abnormally: {e}");
                }
            }
        }
    }

    if !passes.is_empty() {
        info!(aborted = passes.len(), "aborting in-flight passes");
    }
    passes.shutdown().await;
}
