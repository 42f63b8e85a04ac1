//! [`Timer`] implementation on top of tokio's deadline primitives.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::trace;

use super::{Timer, TimerCallback, TimerFactory, TimerState};

/// Shortest period accepted by [`TokioTimer::run_periodic`].
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Shared {
    state: TimerState,
    period: Duration,
    callback: Option<TimerCallback>,
    // Bumped on every arm and stop; an armed task only fires while it still
    // holds the current value.
    generation: u64,
    // Thread running the callback right now.
    firing: Option<ThreadId>,
}

#[derive(Default)]
struct Inner {
    shared: Mutex<Shared>,
    fired: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the callback if `generation` is still current.
    ///
    /// Returns `false` once the timer has been re-armed or stopped.
    fn fire(&self, generation: u64, once: bool) -> bool {
        let callback = {
            let mut state = self.lock();
            if state.generation != generation {
                return false;
            }
            if once {
                state.state = TimerState::Idle;
            }
            state.firing = Some(thread::current().id());
            state.callback.clone()
        };

        let _firing = FiringGuard(self);
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    // Blocks until a callback running on another thread has returned. A
    // callback that re-arms its own timer does not wait for itself.
    fn wait_for_callback<'a>(&'a self, mut state: MutexGuard<'a, Shared>) {
        let me = thread::current().id();
        while state.firing.is_some_and(|id| id != me) {
            state = self
                .fired
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct FiringGuard<'a>(&'a Inner);

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().firing = None;
        self.0.fired.notify_all();
    }
}

/// A timer whose callbacks run as tasks on a tokio runtime.
///
/// Re-arming or stopping waits for a callback already running on another
/// thread, so once [`stop`](Timer::stop) returns the callback is not running
/// and will not run again.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use playwire::reactor::{Timer, TimerState, TokioTimer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut timer = TokioTimer::new(tokio::runtime::Handle::current());
/// timer.set_callback(Arc::new(|| println!("tick")));
/// timer.run_periodic(Duration::from_secs(1));
/// assert_eq!(timer.state(), TimerState::Periodic);
/// timer.stop();
/// assert_eq!(timer.state(), TimerState::Stopped);
/// # }
/// ```
pub struct TokioTimer {
    handle: Handle,
    inner: Arc<Inner>,
    task: Option<JoinHandle<()>>,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            inner: Arc::new(Inner::default()),
            task: None,
        }
    }

    // Invalidates the armed task and moves to `state`; returns the generation
    // a newly armed task must carry.
    fn rearm(&mut self, state: TimerState, period: Duration) -> u64 {
        let mut shared = self.inner.lock();
        shared.generation += 1;
        shared.state = state;
        shared.period = period;
        let generation = shared.generation;
        self.inner.wait_for_callback(shared);

        if let Some(task) = self.task.take() {
            task.abort();
        }
        generation
    }
}

impl Timer for TokioTimer {
    fn state(&self) -> TimerState {
        self.inner.lock().state
    }

    fn period(&self) -> Duration {
        self.inner.lock().period
    }

    fn set_callback(&mut self, callback: TimerCallback) {
        self.inner.lock().callback = Some(callback);
    }

    fn run_once(&mut self, delay: Duration) {
        let generation = self.rearm(TimerState::OnceScheduled, Duration::ZERO);
        let inner = Arc::clone(&self.inner);
        let deadline = Instant::now() + delay;

        trace!(?delay, generation, "timer armed once");

        self.task = Some(self.handle.spawn(async move {
            time::sleep_until(deadline).await;
            inner.fire(generation, true);
        }));
    }

    fn run_periodic(&mut self, period: Duration) {
        let period = period.max(MIN_PERIOD);
        let generation = self.rearm(TimerState::Periodic, period);
        let inner = Arc::clone(&self.inner);
        let mut deadline = Instant::now() + period;

        trace!(?period, generation, "timer armed periodic");

        self.task = Some(self.handle.spawn(async move {
            loop {
                time::sleep_until(deadline).await;
                if !inner.fire(generation, false) {
                    return;
                }

                // Next deadline is relative to the nominal one, so a slow
                // callback delays at most one firing and never shifts the grid.
                deadline += period;
            }
        }));
    }

    fn stop(&mut self) {
        self.rearm(TimerState::Stopped, Duration::ZERO);
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hands out [`TokioTimer`]s bound to one runtime.
#[derive(Debug, Clone)]
pub struct TokioTimerFactory {
    handle: Handle,
}

impl TokioTimerFactory {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TimerFactory for TokioTimerFactory {
    fn create_timer(&self) -> Box<dyn Timer> {
        Box::new(TokioTimer::new(self.handle.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(timer: &mut dyn Timer) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timer.set_callback(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test(start_paused = true)]
    async fn once_fires_exactly_once_after_delay() {
        let mut timer = TokioTimer::new(Handle::current());
        let count = counting(&mut timer);

        timer.run_once(Duration::from_millis(100));
        assert_eq!(timer.state(), TimerState::OnceScheduled);

        time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Idle);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_deadline_suppresses_callback() {
        let mut timer = TokioTimer::new(Handle::current());
        let count = counting(&mut timer);

        timer.run_once(Duration::from_millis(50));
        time::sleep(Duration::from_millis(10)).await;
        timer.stop();
        timer.stop();

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.state(), TimerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_pending_deadline() {
        let mut timer = TokioTimer::new(Handle::current());
        let count = counting(&mut timer);

        timer.run_once(Duration::from_millis(100));
        timer.run_once(Duration::from_millis(300));

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(101)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_once_per_elapsed_period() {
        let mut timer = TokioTimer::new(Handle::current());
        let count = counting(&mut timer);

        timer.run_periodic(Duration::from_millis(100));
        assert_eq!(timer.period(), Duration::from_millis(100));

        time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);

        timer.stop();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(timer.period(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_deadlines_stay_on_nominal_grid() {
        let mut timer = TokioTimer::new(Handle::current());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        timer.set_callback(Arc::new(move || f.lock().unwrap().push(Instant::now())));

        let start = Instant::now();
        timer.run_periodic(Duration::from_millis(250));
        time::sleep(Duration::from_millis(1100)).await;

        let offsets: Vec<_> = fired
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis())
            .collect();
        assert_eq!(offsets, vec![250, 500, 750, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_callback_discards_previous() {
        let mut timer = TokioTimer::new(Handle::current());
        let first = counting(&mut timer);
        let second = counting(&mut timer);

        timer.run_once(Duration::from_millis(1));
        time::sleep(Duration::from_millis(5)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_timer_cancels_schedule() {
        let factory = TokioTimerFactory::new(Handle::current());
        let mut timer = factory.create_timer();
        assert_eq!(timer.state(), TimerState::Idle);
        let count = counting(timer.as_mut());

        timer.run_periodic(Duration::from_millis(10));
        drop(timer);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    // Real clock: a blocking callback cannot advance the paused one.
    #[tokio::test]
    async fn slow_callbacks_do_not_reduce_periodic_count() {
        let mut timer = TokioTimer::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timer.set_callback(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(70));
        }));

        timer.run_periodic(Duration::from_millis(100));
        time::sleep(Duration::from_millis(1050)).await;
        timer.stop();

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_for_callback_running_elsewhere() {
        let mut timer = TokioTimer::new(Handle::current());
        let entered = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (e, f) = (Arc::clone(&entered), Arc::clone(&finished));
        timer.set_callback(Arc::new(move || {
            e.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
        }));

        timer.run_periodic(Duration::from_millis(5));
        while entered.load(Ordering::SeqCst) == 0 {
            time::sleep(Duration::from_millis(1)).await;
        }
        timer.stop();

        let fired = finished.load(Ordering::SeqCst);
        assert_eq!(fired, entered.load(Ordering::SeqCst));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), fired);
    }
}
