//! Cross-thread work hand-off onto the reactor.
//!
//! [`ExternalWorkQueue`] holds the pending FIFO and the "drain already
//! scheduled" flag, so wake-ups from many producers coalesce into a single
//! drain. The backend only has to say *how* a drain gets onto its loop, via
//! [`Schedule`]; [`TokioScheduler`] does it with `Handle::spawn`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{trace, warn};

use super::WorkQueue;

/// A one-shot unit of work to run on the reactor thread.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Posts a [`Drain`] onto an event loop.
///
/// Called at most once per batch: the queue does not call it again until the
/// previously posted drain has started running.
pub trait Schedule: Send + Sync + 'static {
    fn schedule(&self, drain: Drain);
}

#[derive(Default)]
struct Pending {
    items: Vec<Work>,
    scheduled: bool,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The trampoline posted to the reactor.
///
/// Running it takes a snapshot of everything enqueued so far and executes it
/// in enqueue order. Work enqueued while the snapshot runs schedules a new
/// drain.
///
/// A drain dropped without running (its loop has shut down) clears the
/// scheduled flag, so the next enqueue posts a fresh one.
#[must_use = "a drain that is never run strands the queued work"]
pub struct Drain {
    shared: Arc<Shared>,
    ran: bool,
}

impl Drain {
    fn new(shared: Arc<Shared>) -> Self {
        Self { shared, ran: false }
    }

    pub fn run(mut self) {
        self.ran = true;
        let items = {
            let mut pending = self.shared.lock();
            pending.scheduled = false;
            std::mem::take(&mut pending.items)
        };

        trace!(count = items.len(), "draining work queue");

        for work in items {
            work();
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        if self.ran {
            return;
        }
        let mut pending = self.shared.lock();
        pending.scheduled = false;
        warn!(count = pending.items.len(), "work queue drain discarded before running");
    }
}

/// A work queue fed from any thread and drained by a [`Schedule`] backend.
///
/// # Examples
///
/// ```
/// use playwire::reactor::{TokioWorkQueue, WorkQueue};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = TokioWorkQueue::new(tokio::runtime::Handle::current());
/// let (tx, rx) = tokio::sync::oneshot::channel();
///
/// std::thread::spawn(move || {
///     queue.enqueue(Box::new(move || tx.send("ran on the reactor").unwrap()));
/// });
///
/// assert_eq!(rx.await.unwrap(), "ran on the reactor");
/// # }
/// ```
pub struct ExternalWorkQueue<S: Schedule> {
    shared: Arc<Shared>,
    scheduler: S,
}

impl<S: Schedule> ExternalWorkQueue<S> {
    pub fn with_scheduler(scheduler: S) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            scheduler,
        }
    }

    /// Number of items waiting for the next drain.
    pub fn pending(&self) -> usize {
        self.shared.lock().items.len()
    }
}

impl<S: Schedule> WorkQueue for ExternalWorkQueue<S> {
    fn enqueue(&self, work: Work) {
        let needs_drain = {
            let mut pending = self.shared.lock();
            pending.items.push(work);
            !std::mem::replace(&mut pending.scheduled, true)
        };

        if needs_drain {
            self.scheduler.schedule(Drain::new(Arc::clone(&self.shared)));
        }
    }
}

/// Posts drains onto a tokio runtime. Stateless.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl Schedule for TokioScheduler {
    fn schedule(&self, drain: Drain) {
        self.handle.spawn(async move { drain.run() });
    }
}

/// Work queue drained on a tokio runtime.
pub type TokioWorkQueue = ExternalWorkQueue<TokioScheduler>;

impl TokioWorkQueue {
    pub fn new(handle: Handle) -> Self {
        Self::with_scheduler(TokioScheduler { handle })
    }
}
