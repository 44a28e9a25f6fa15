//! Process-wide scheduler for timeout and retry callbacks.
//!
//! The scheduler owns a small tokio worker pool that only exists while at
//! least one client is registered. Registration and teardown are serialized
//! by a single lock so a concurrent `register`/`unregister` pair can never
//! leave a pool running with no owners, or no pool with owners.
//!
//! # Example
//!
//! ```rust
//! use servicebus_core::{ClientId, ScheduleMode, SharedScheduler};
//! use std::time::Duration;
//!
//! let scheduler = SharedScheduler::new();
//! let owner = ClientId::new();
//!
//! scheduler.register(owner).unwrap();
//! let task = scheduler
//!     .schedule(Duration::from_secs(60), ScheduleMode::OneTimeRun, || {})
//!     .unwrap();
//! task.cancel();
//! scheduler.unregister(&owner);
//! assert!(!scheduler.is_running());
//! ```

use crate::error::MessagingError;
use crate::ClientId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Lower bound on the worker pool size, regardless of available parallelism.
pub const MIN_WORKER_THREADS: usize = 4;

const WORKER_THREAD_NAME: &str = "servicebus-timer";

static GLOBAL_SCHEDULER: OnceLock<Arc<SharedScheduler>> = OnceLock::new();

/// How often a scheduled callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Fire once after the delay.
    OneTimeRun,
    /// Fire every `delay`, starting one `delay` from now, until cancelled.
    RepeatRun,
}

/// Revocable handle to a scheduled callback.
///
/// Dropping the handle does not cancel the callback.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
    mode: ScheduleMode,
}

impl ScheduledTask {
    /// Cancel the callback if it has not run yet.
    ///
    /// Returns `false` when the task had already finished, which is the
    /// benign "already fired" race for one-time callbacks.
    pub fn cancel(&self) -> bool {
        if self.handle.is_finished() {
            return false;
        }
        self.handle.abort();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }
}

struct SchedulerState {
    registrants: HashSet<ClientId>,
    runtime: Option<Runtime>,
    pool_size: usize,
    min_threads: usize,
}

/// Reference-counted background scheduler shared by all clients.
///
/// Most callers use [`SharedScheduler::global`] and pass the resulting handle
/// to the components that need it; tests create isolated instances with
/// [`SharedScheduler::new`].
pub struct SharedScheduler {
    state: Mutex<SchedulerState>,
}

impl Default for SharedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedScheduler {
    /// Create an isolated scheduler with the default pool floor.
    pub fn new() -> Self {
        Self::with_min_threads(MIN_WORKER_THREADS)
    }

    /// Create an isolated scheduler whose pool has at least `min_threads` workers.
    pub fn with_min_threads(min_threads: usize) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                registrants: HashSet::new(),
                runtime: None,
                pool_size: 0,
                min_threads: min_threads.max(1),
            }),
        }
    }

    /// The process-wide scheduler instance.
    pub fn global() -> Arc<SharedScheduler> {
        Arc::clone(GLOBAL_SCHEDULER.get_or_init(|| Arc::new(SharedScheduler::new())))
    }

    /// Add `owner` to the registrant set, starting the pool if needed.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The owner was newly registered
    /// - `Ok(false)`: The owner was already registered
    /// - `Err(MessagingError::InvalidState)`: The worker pool could not be started
    pub fn register(&self, owner: ClientId) -> Result<bool, MessagingError> {
        let mut state = self.lock_state();

        if state.runtime.is_none() {
            let pool_size = pool_size_for_host(state.min_threads);
            let runtime = Builder::new_multi_thread()
                .worker_threads(pool_size)
                .thread_name(WORKER_THREAD_NAME)
                .enable_time()
                .build()
                .map_err(|e| MessagingError::InvalidState {
                    operation: "register".to_string(),
                    message: format!("failed to start scheduler pool: {}", e),
                })?;
            state.runtime = Some(runtime);
            state.pool_size = pool_size;
            info!(pool_size, "Started shared scheduler");
        }

        let inserted = state.registrants.insert(owner);
        debug!(
            owner = %owner,
            registrants = state.registrants.len(),
            "Registered scheduler owner"
        );
        Ok(inserted)
    }

    /// Remove `owner`; the last owner out shuts the pool down.
    ///
    /// Shutdown cancels every callback that has not run yet.
    pub fn unregister(&self, owner: &ClientId) -> bool {
        let mut state = self.lock_state();

        let removed = state.registrants.remove(owner);
        if removed {
            debug!(
                owner = %owner,
                registrants = state.registrants.len(),
                "Unregistered scheduler owner"
            );
        }

        if state.registrants.is_empty() {
            if let Some(runtime) = state.runtime.take() {
                runtime.shutdown_background();
                state.pool_size = 0;
                info!("Stopped shared scheduler");
            }
        }

        removed
    }

    /// Run `callback` after `delay`, once or repeatedly per `mode`.
    ///
    /// The registration lock is held only long enough to obtain the pool.
    /// Callbacks run on the scheduler's worker threads and must not block.
    /// A failing callback is never retried by the scheduler.
    pub fn schedule<F>(
        &self,
        delay: Duration,
        mode: ScheduleMode,
        mut callback: F,
    ) -> Result<ScheduledTask, MessagingError>
    where
        F: FnMut() + Send + 'static,
    {
        if mode == ScheduleMode::RepeatRun && delay.is_zero() {
            return Err(MessagingError::InvalidState {
                operation: "schedule".to_string(),
                message: "repeating tasks need a non-zero period".to_string(),
            });
        }

        let handle = {
            let state = self.lock_state();
            match state.runtime.as_ref() {
                Some(runtime) => runtime.handle().clone(),
                None => return Err(MessagingError::SchedulerUnavailable),
            }
        };

        let join = handle.spawn(async move {
            match mode {
                ScheduleMode::OneTimeRun => {
                    tokio::time::sleep(delay).await;
                    callback();
                }
                ScheduleMode::RepeatRun => {
                    let mut ticker = tokio::time::interval_at(Instant::now() + delay, delay);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        callback();
                    }
                }
            }
        });

        Ok(ScheduledTask {
            handle: join.abort_handle(),
            mode,
        })
    }

    /// Change the pool floor.
    ///
    /// Applies the next time the pool starts; a running pool keeps its size.
    pub fn set_min_threads(&self, min_threads: usize) {
        self.lock_state().min_threads = min_threads.max(1);
    }

    pub fn min_threads(&self) -> usize {
        self.lock_state().min_threads
    }

    /// Whether the worker pool currently exists.
    pub fn is_running(&self) -> bool {
        self.lock_state().runtime.is_some()
    }

    pub fn registrant_count(&self) -> usize {
        self.lock_state().registrants.len()
    }

    /// Worker count of the running pool, if any.
    pub fn pool_size(&self) -> Option<usize> {
        let state = self.lock_state();
        state.runtime.as_ref().map(|_| state.pool_size)
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn pool_size_for_host(min_threads: usize) -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    parallelism.max(min_threads)
}

impl Drop for SharedScheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = state.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for SharedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("SharedScheduler")
            .field("registrants", &state.registrants.len())
            .field("running", &state.runtime.is_some())
            .field("pool_size", &state.pool_size)
            .finish()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
