//! Deferred-callback scheduling.
//!
//! The engine never blocks and never dispatches reentrantly; everything that
//! must happen "later" (queued loopback deliveries, no-reply watchdogs) goes
//! through a [`Scheduler`]. Two drivers are provided: a deterministic
//! logical-time queue for tests and in-process use, and a tokio-backed driver
//! for current-thread runtimes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// One-shot callback fired by a scheduler.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Opaque handle identifying a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Deferred-callback capability consumed by the transports.
pub trait Scheduler {
    /// Schedule `callback` to run after `delay`. A zero delay means "as soon
    /// as the current callback stack has unwound", never synchronously.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a scheduled callback. Cancelling an already-fired or unknown
    /// handle is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// Shared scheduler handle.
pub type SharedScheduler = Rc<dyn Scheduler>;

struct ManualEntry {
    seq: u64,
    deadline: Duration,
    callback: TimerCallback,
}

struct ManualInner {
    now: Duration,
    next_seq: u64,
    entries: Vec<ManualEntry>,
}

/// Deterministic logical-time scheduler.
///
/// Nothing fires on its own; the owner drives the queue with
/// [`ManualScheduler::run_until_idle`] or [`ManualScheduler::advance`].
/// Entries fire in (deadline, insertion) order, so zero-delay callbacks keep
/// their submission order.
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Rc<RefCell<ManualInner>>,
}

impl ManualScheduler {
    /// Create a scheduler with logical time at zero.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManualInner {
                now: Duration::ZERO,
                next_seq: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    fn pop_due(&self, limit: Option<Duration>) -> Option<TimerCallback> {
        let mut inner = self.inner.borrow_mut();

        let best = inner
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.deadline, e.seq))
            .map(|(i, e)| (i, e.deadline))?;

        if let Some(limit) = limit {
            if best.1 > limit {
                return None;
            }
        }

        // Firing advances logical time to the entry's deadline.
        let entry = inner.entries.swap_remove(best.0);
        if entry.deadline > inner.now {
            inner.now = entry.deadline;
        }
        Some(entry.callback)
    }

    /// Fire every queued callback, including ones scheduled while draining,
    /// advancing logical time as needed. Returns the number fired.
    pub fn run_until_idle(&self) -> usize {
        let mut fired = 0;
        while let Some(callback) = self.pop_due(None) {
            callback();
            fired += 1;
        }
        fired
    }

    /// Advance logical time by `delta`, firing every callback that falls due.
    /// Returns the number fired.
    pub fn advance(&self, delta: Duration) -> usize {
        let limit = self.inner.borrow().now + delta;
        let mut fired = 0;
        while let Some(callback) = self.pop_due(Some(limit)) {
            callback();
            fired += 1;
        }
        self.inner.borrow_mut().now = limit;
        fired
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let deadline = inner.now + delay;
        inner.entries.push(ManualEntry {
            seq,
            deadline,
            callback,
        });
        TimerHandle(seq)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.inner
            .borrow_mut()
            .entries
            .retain(|e| e.seq != handle.0);
    }
}

struct TokioInner {
    next_seq: u64,
    tasks: HashMap<u64, tokio::task::JoinHandle<()>>,
}

/// Scheduler backed by `tokio::time` on a current-thread runtime.
///
/// Callbacks are `!Send`, so tasks are spawned with `spawn_local`; callers
/// must be inside a `LocalSet`.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Rc<RefCell<TokioInner>>,
}

impl TokioScheduler {
    /// Create a tokio-backed scheduler.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TokioInner {
                next_seq: 1,
                tasks: HashMap::new(),
            })),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let weak = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().tasks.remove(&seq);
            }
            callback();
        });

        inner.tasks.insert(seq, task);
        TimerHandle(seq)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.inner.borrow_mut().tasks.remove(&handle.0) {
            task.abort();
        }
    }
}
