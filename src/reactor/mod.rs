//! Timer and deferred-work adapters for a cooperative event loop.
//!
//! The server layer schedules timeouts and cross-thread work through two
//! small capability traits, [`Timer`] and [`WorkQueue`], without knowing
//! which loop runs them. This module provides the tokio-backed
//! implementations:
//!
//! - [`TokioTimer`] / [`TokioTimerFactory`] arm deadlines on a runtime handle.
//! - [`TokioWorkQueue`] drains externally enqueued work on the runtime.
//!
//! Give them the handle of a current-thread runtime to get a single-threaded
//! reactor: every timer callback and every drained work item then runs on
//! that one thread, never concurrently with each other.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod timer;
pub mod work_queue;

pub use timer::{TokioTimer, TokioTimerFactory};
pub use work_queue::{Drain, ExternalWorkQueue, Schedule, TokioScheduler, TokioWorkQueue, Work};

/// Callback invoked each time a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Where a [`Timer`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    /// Never armed, or a one-shot deadline already fired.
    #[default]
    Idle,
    /// A single deadline is armed.
    OnceScheduled,
    /// Re-arms itself after every firing.
    Periodic,
    /// Cancelled by [`Timer::stop`].
    Stopped,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerState::Idle => "idle",
            TimerState::OnceScheduled => "once-scheduled",
            TimerState::Periodic => "periodic",
            TimerState::Stopped => "stopped",
        })
    }
}

/// A single-shot or periodic callback schedule.
///
/// Holds at most one callback; [`set_callback`](Timer::set_callback) replaces
/// it. Arming a timer cancels whatever it was armed for before. Dropping a
/// timer stops it.
pub trait Timer: Send {
    fn state(&self) -> TimerState;

    /// The period of a periodic schedule, zero otherwise.
    fn period(&self) -> Duration;

    fn set_callback(&mut self, callback: TimerCallback);

    /// Fires the callback once, no earlier than `delay` from now.
    fn run_once(&mut self, delay: Duration);

    /// Fires the callback every `period`, measured from nominal deadlines.
    fn run_periodic(&mut self, period: Duration);

    /// Cancels any pending firing. Idempotent.
    fn stop(&mut self);
}

/// Creates timers bound to one reactor.
pub trait TimerFactory: Send + Sync {
    fn create_timer(&self) -> Box<dyn Timer>;
}

/// A queue other threads use to run work on the reactor thread.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, work: Work);
}
