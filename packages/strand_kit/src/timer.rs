//! Reschedulable one-shot callbacks driven by a single sleeping task
//!
//! Every [`TimerCallback`] owns at most one node in a [`BinaryHeap`] keyed by
//! its [`Deadline`]. All heap mutation runs on the timer's own [`Strand`].
//! One driver task sleeps until the earliest deadline and then asks the
//! strand to fire whatever is due. A fired node is not removed: its key is
//! moved to [`Deadline::Never`] so the same node can be rescheduled later.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::heap::{BinaryHeap, NodeHandle};
use crate::strand::{Strand, StrandTask, panic_message};

/// Wakeups are armed slightly after the deadline so a wakeup never lands
/// just before it.
const ARM_MARGIN: Duration = Duration::from_millis(1);

/// Longest single sleep; later deadlines wake early and re-arm
const MAX_SLEEP: Duration = Duration::from_secs(86400 * 365 * 30);

/// When a callback should fire
///
/// `Never` sorts after every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    At(Instant),
    Never,
}

impl Deadline {
    /// Deadline `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::offset(Instant::now(), duration)
    }

    /// Deadline `duration` after `start`; `Never` when that instant is not
    /// representable
    pub fn offset(start: Instant, duration: Duration) -> Self {
        start
            .checked_add(duration)
            .map_or(Deadline::Never, Deadline::At)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self, Deadline::At(at) if *at <= now)
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Deadline,
    id: u64,
}

struct Registration {
    node: NodeHandle,
    callback: Callback,
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    registrations: HashMap<u64, Registration>,
    /// Deadline last handed to the driver
    armed: Deadline,
}

struct TimerShared {
    strand: Strand,
    /// Only ever locked from actions running on `strand`
    state: Mutex<TimerState>,
    arm: watch::Sender<Deadline>,
    next_id: AtomicU64,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reschedule(&self, id: u64, deadline: Deadline, callback: &Callback) {
        {
            let mut state = self.lock();
            let entry = Entry { deadline, id };
            match state.registrations.get(&id).map(|r| r.node) {
                Some(node) => {
                    state.heap.set(node, entry);
                }
                None => {
                    let node = state.heap.insert(entry);
                    state.registrations.insert(
                        id,
                        Registration {
                            node,
                            callback: callback.clone(),
                        },
                    );
                }
            }
        }
        trace!(id, ?deadline, "timer callback rescheduled");
        self.refresh();
    }

    fn forget(&self, id: u64) {
        {
            let mut state = self.lock();
            if let Some(registration) = state.registrations.remove(&id) {
                state.heap.remove(registration.node);
            }
        }
        self.refresh();
    }

    fn process_due(&self) {
        let now = Instant::now();
        let due: Vec<Callback> = {
            let mut state = self.lock();
            state.armed = Deadline::Never;
            let mut due = Vec::new();
            while let Ok(top) = state.heap.peek() {
                let Some(entry) = state.heap.get(top).copied() else {
                    break;
                };
                if !entry.deadline.is_due(now) {
                    break;
                }
                state.heap.set(
                    top,
                    Entry {
                        deadline: Deadline::Never,
                        id: entry.id,
                    },
                );
                if let Some(registration) = state.registrations.get(&entry.id) {
                    due.push(registration.callback.clone());
                }
            }
            due
        };

        if due.is_empty() {
            debug!("timer woke up with nothing due");
        }
        for callback in due {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                error!(
                    "timer callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        self.refresh();
    }

    /// Hand the current heap minimum to the driver if it changed
    fn refresh(&self) {
        let mut state = self.lock();
        let next = state
            .heap
            .peek()
            .ok()
            .and_then(|top| state.heap.get(top))
            .map(|entry| entry.deadline)
            .unwrap_or(Deadline::Never);
        if next != state.armed {
            state.armed = next;
            self.arm.send_replace(next);
        }
    }
}

fn wake_time(at: Instant) -> Instant {
    let wake = at.checked_add(ARM_MARGIN).unwrap_or(at);
    match Instant::now().checked_add(MAX_SLEEP) {
        Some(latest) => wake.min(latest),
        None => wake,
    }
}

async fn drive(shared: Weak<TimerShared>, mut armed: watch::Receiver<Deadline>) {
    loop {
        let deadline = *armed.borrow_and_update();
        match deadline {
            Deadline::Never => {
                if armed.changed().await.is_err() {
                    break;
                }
            }
            Deadline::At(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake_time(at)) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        let firing = shared.clone();
                        drop(shared.strand.schedule_exclusive(move || firing.process_due()));
                        drop(shared);
                        // process_due re-arms once it has drained the heap
                        if armed.changed().await.is_err() {
                            break;
                        }
                    }
                    changed = armed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("timer driver stopped");
}

/// Schedules [`TimerCallback`]s; cheap to clone
#[derive(Clone)]
pub struct TimerThread {
    shared: Arc<TimerShared>,
}

impl Default for TimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerThread {
    /// Create a timer with its own strand and driver task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        let (arm, armed) = watch::channel(Deadline::Never);
        let shared = Arc::new(TimerShared {
            strand: Strand::new("timer"),
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                registrations: HashMap::new(),
                armed: Deadline::Never,
            }),
            arm,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(drive(Arc::downgrade(&shared), armed));
        Self { shared }
    }

    /// Bind `callback` to a new, unscheduled timer entry
    pub fn register_callback<F>(&self, callback: F) -> TimerCallback
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerCallback {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            shared: self.shared.clone(),
            callback: Arc::new(callback),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One reschedulable timer entry
///
/// The callback runs on the timer's strand; it should hand real work to
/// another strand rather than do it inline. Dropping the handle disposes it.
pub struct TimerCallback {
    id: u64,
    shared: Arc<TimerShared>,
    callback: Callback,
    disposed: Arc<AtomicBool>,
}

impl TimerCallback {
    /// Move this entry to `deadline`. `Deadline::Never` keeps the entry but
    /// stops it firing. The task resolves once the heap reflects the change.
    pub fn reschedule(&self, deadline: Deadline) -> StrandTask<()> {
        let shared = self.shared.clone();
        let callback = self.callback.clone();
        let disposed = self.disposed.clone();
        let id = self.id;
        self.shared.strand.schedule_exclusive(move || {
            if !disposed.load(Ordering::SeqCst) {
                shared.reschedule(id, deadline, &callback);
            }
        })
    }

    /// Remove this entry for good. Safe to call more than once.
    pub fn dispose(&self) -> StrandTask<()> {
        self.disposed.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let id = self.id;
        self.shared
            .strand
            .schedule_exclusive(move || shared.forget(id))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for TimerCallback {
    fn drop(&mut self) {
        if !self.is_disposed() {
            drop(self.dispose());
        }
    }
}
