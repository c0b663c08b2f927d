//! Single-threaded cooperative scheduler.
//!
//! Everything in the daemon runs on one thread. State lives in a single
//! context value (the controller), and every piece of work is a callback
//! `FnOnce(&mut C, &mut Scheduler<C>)` dispatched by the reactor between
//! await points. I/O tasks (the gateway link, the schema fetch) own their
//! sockets and deliver results by sending callbacks through an
//! [`Injector`]; the reactor itself owns no file descriptors.
//!
//! Ordering rules, which the controller depends on:
//! - run-later callbacks run FIFO, after the current callback chain
//!   unwinds and before the reactor blocks again;
//! - timers with equal deadlines fire in insertion order;
//! - injected callbacks dispatch in send order.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// A unit of deferred work operating on the shared context.
pub type Callback<C> = Box<dyn FnOnce(&mut C, &mut Scheduler<C>)>;

/// Per-iteration hook, invoked with the time until the next timer (or
/// `None` when the reactor would block indefinitely).
pub type LoopHook<C> = Box<dyn FnMut(&mut C, &mut Scheduler<C>, Option<Duration>)>;

/// Handle for cancelling a pending timer. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Handle for removing a loop hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopHandle(u64);

struct TimerEntry<C> {
    deadline: Instant,
    seq: u64,
    cb: Callback<C>,
}

impl<C> PartialEq for TimerEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<C> Eq for TimerEntry<C> {}
impl<C> PartialOrd for TimerEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<C> Ord for TimerEntry<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline (and
        // for ties, the earliest registration) pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Timer queue, deferral queue, and loop hooks. Callbacks receive
/// `&mut Scheduler` so they can re-register freely; structural mutation
/// never happens while the scheduler iterates.
pub struct Scheduler<C> {
    timers: BinaryHeap<TimerEntry<C>>,
    cancelled: HashSet<u64>,
    later: VecDeque<Callback<C>>,
    hooks: Vec<(u64, LoopHook<C>)>,
    seq: u64,
    exit: bool,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self {
            timers: BinaryHeap::new(),
            cancelled: HashSet::new(),
            later: VecDeque::new(),
            hooks: Vec::new(),
            seq: 0,
            exit: false,
        }
    }
}

impl<C> Scheduler<C> {
    /// One-shot timer on the monotonic clock.
    pub fn add_timeout(
        &mut self,
        delay: Duration,
        cb: impl FnOnce(&mut C, &mut Scheduler<C>) + 'static,
    ) -> TimerHandle {
        self.seq += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.seq,
            cb: Box::new(cb),
        });
        TimerHandle(self.seq)
    }

    /// Cancel a pending timer. Idempotent; returns whether the timer was
    /// still pending. The callback itself is dropped lazily, once the
    /// entry surfaces in the queue, so cancellation from inside a
    /// callback never destroys state that is still on the stack.
    pub fn remove_timeout(&mut self, handle: TimerHandle) -> bool {
        // Membership test against seq: handles of fired timers are gone
        // from the heap, so only ids that are still queued and not yet
        // cancelled count as removed.
        if !self.cancelled.contains(&handle.0) && self.timers.iter().any(|t| t.seq == handle.0) {
            self.cancelled.insert(handle.0);
            true
        } else {
            false
        }
    }

    /// Run `cb` after the current callback chain unwinds, before the
    /// reactor blocks again. FIFO.
    pub fn run_later(&mut self, cb: impl FnOnce(&mut C, &mut Scheduler<C>) + 'static) {
        self.later.push_back(Box::new(cb));
    }

    /// Register a per-iteration hook.
    pub fn add_loop(
        &mut self,
        cb: impl FnMut(&mut C, &mut Scheduler<C>, Option<Duration>) + 'static,
    ) -> LoopHandle {
        self.seq += 1;
        self.hooks.push((self.seq, Box::new(cb)));
        LoopHandle(self.seq)
    }

    /// Remove a loop hook. Idempotent.
    pub fn remove_loop(&mut self, handle: LoopHandle) {
        self.hooks.retain(|(id, _)| *id != handle.0);
    }

    /// Stop the reactor at the next observable boundary.
    pub fn exit(&mut self) {
        self.exit = true;
    }

    fn pop_due(&mut self, now: Instant) -> Option<Callback<C>> {
        while let Some(entry) = self.timers.peek() {
            if entry.deadline > now {
                return None;
            }
            let entry = self.timers.pop().expect("peeked entry");
            if self.cancelled.remove(&entry.seq) {
                continue;
            }
            return Some(entry.cb);
        }
        None
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.timers.peek() {
            if self.cancelled.remove(&entry.seq) {
                self.timers.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    fn idle(&self) -> bool {
        self.timers.len() == self.cancelled.len() && self.later.is_empty() && self.hooks.is_empty()
    }
}

/// Clonable sender used by I/O tasks to deliver work to the reactor.
pub struct Injector<C> {
    tx: mpsc::UnboundedSender<Callback<C>>,
}

impl<C> Clone for Injector<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> Injector<C> {
    /// Queue a callback for dispatch on the reactor thread. Silently
    /// dropped if the reactor is gone; a sender outliving the loop has
    /// nothing useful left to do with an error.
    pub fn send(&self, cb: impl FnOnce(&mut C, &mut Scheduler<C>) + 'static) {
        let _ = self.tx.send(Box::new(cb));
    }
}

/// The event loop. Create one, hand [`Injector`] clones to I/O tasks,
/// then `run` it to completion with the context.
pub struct Reactor<C> {
    sched: Scheduler<C>,
    rx: mpsc::UnboundedReceiver<Callback<C>>,
    rx_open: bool,
}

impl<C> Reactor<C> {
    pub fn new() -> (Self, Injector<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sched: Scheduler::default(),
                rx,
                rx_open: true,
            },
            Injector { tx },
        )
    }

    /// Access the scheduler before the loop starts, e.g. to arm the
    /// initial timers.
    pub fn scheduler(&mut self) -> &mut Scheduler<C> {
        &mut self.sched
    }

    /// Run until exit is requested or nothing remains that could ever
    /// produce another callback.
    pub async fn run(&mut self, ctx: &mut C) {
        loop {
            // Deferred work first: it must run before blocking and may
            // re-arm timers or request exit.
            while let Some(cb) = self.sched.later.pop_front() {
                cb(ctx, &mut self.sched);
            }
            if self.sched.exit {
                break;
            }

            // Expired timers, oldest first. Firing may enqueue deferred
            // work, which takes priority over further timers.
            let now = Instant::now();
            let mut fired = false;
            while self.sched.later.is_empty() {
                match self.sched.pop_due(now) {
                    Some(cb) => {
                        cb(ctx, &mut self.sched);
                        fired = true;
                    }
                    None => break,
                }
            }
            if fired || !self.sched.later.is_empty() {
                continue;
            }

            // Loop hooks see the sleep horizon and may shorten it by
            // adding an earlier timer.
            let horizon = self.sched.next_deadline();
            if !self.sched.hooks.is_empty() {
                let mut hooks = std::mem::take(&mut self.sched.hooks);
                let until = horizon.map(|d| d.saturating_duration_since(now));
                for (_, hook) in &mut hooks {
                    hook(ctx, &mut self.sched, until);
                }
                // Hooks registered during iteration land behind the
                // existing ones.
                let added = std::mem::replace(&mut self.sched.hooks, hooks);
                self.sched.hooks.extend(added);
                if !self.sched.later.is_empty() || self.sched.exit {
                    continue;
                }
            }
            let horizon = self.sched.next_deadline();

            if self.sched.idle() && !self.rx_open {
                break;
            }

            match (horizon, self.rx_open) {
                (Some(deadline), true) => {
                    tokio::select! {
                        biased;
                        cb = self.rx.recv() => match cb {
                            Some(cb) => cb(ctx, &mut self.sched),
                            None => self.rx_open = false,
                        },
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                (Some(deadline), false) => {
                    tokio::time::sleep_until(deadline).await;
                }
                (None, true) => match self.rx.recv().await {
                    Some(cb) => cb(ctx, &mut self.sched),
                    None => self.rx_open = false,
                },
                (None, false) => break,
            }
        }
    }
}
