//! Single-threaded main loop with explicit priority tiers.
//!
//! All device work in a session runs as tasks on one [`MainLoop`]. Tasks are
//! dispatched strictly by tier: every queued [`Priority::High`] task runs
//! before any [`Priority::Default`] task, which in turn runs before any
//! [`Priority::Idle`] task. Within a tier, order is FIFO. Long-running
//! operations hand back a [`Completion`] that a later task resolves; callers
//! that want synchronous behavior iterate the loop until it does.
//!
//! Iteration may nest: a task can itself wait on a completion, which runs
//! further tasks from inside the outer dispatch.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::{LoopError, LoopResult};

/// Dispatch tier of a queued task. Lower tiers are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Injected work that must run before pending device steps.
    High = 0,
    /// Device operation steps and completions.
    Default = 1,
    /// Work that only runs when nothing else is queued.
    Idle = 2,
}

impl Priority {
    /// All tiers, in dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Default, Priority::Idle];

    #[inline]
    pub fn as_index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Default => write!(f, "default"),
            Priority::Idle => write!(f, "idle"),
        }
    }
}

/// Identifier handed out for every scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

struct QueuedTask {
    id: TaskId,
    label: &'static str,
    run: Box<dyn FnOnce()>,
}

/// Dispatch counters for a loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub scheduled: u64,
    pub dispatched: u64,
    pub dropped: u64,
    /// Dispatches per tier `[High, Default, Idle]`.
    pub per_priority_dispatched: [u64; 3],
    pub max_depth: u32,
}

/// Cooperative single-threaded task queue with priority tiers.
pub struct MainLoop {
    queues: RefCell<[VecDeque<QueuedTask>; 3]>,
    next_id: Cell<u64>,
    running: Cell<bool>,
    depth: Cell<u32>,
    stats: RefCell<LoopStats>,
}

impl MainLoop {
    /// Creates a running loop with empty queues.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            queues: RefCell::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            next_id: Cell::new(1),
            running: Cell::new(true),
            depth: Cell::new(0),
            stats: RefCell::new(LoopStats::default()),
        })
    }

    /// Queues a one-shot task at the given tier.
    pub fn schedule(
        &self,
        priority: Priority,
        label: &'static str,
        task: impl FnOnce() + 'static,
    ) -> LoopResult<TaskId> {
        if !self.running.get() {
            return Err(LoopError::Stopped);
        }
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.queues.borrow_mut()[priority.as_index()].push_back(QueuedTask {
            id,
            label,
            run: Box::new(task),
        });
        self.stats.borrow_mut().scheduled += 1;
        trace!(task = id.0, label, %priority, "scheduled");
        Ok(id)
    }

    /// Queues a one-shot callback, the way an application injects work
    /// between driver steps.
    pub fn idle_add(&self, priority: Priority, task: impl FnOnce() + 'static) -> LoopResult<TaskId> {
        self.schedule(priority, "idle-callback", task)
    }

    /// Resolves `completion` with `value` from a task at `priority`, so the
    /// caller observes the result on a later iteration rather than inline.
    pub fn complete_in_idle<T: 'static>(
        &self,
        priority: Priority,
        completion: &Completion<T>,
        value: T,
    ) -> LoopResult<TaskId> {
        let completion = completion.clone();
        self.schedule(priority, completion.label(), move || completion.resolve(value))
    }

    /// Runs the highest-priority queued task, if any.
    ///
    /// Returns `Ok(false)` when all queues are empty.
    pub fn iteration(&self) -> LoopResult<bool> {
        if !self.running.get() {
            return Err(LoopError::Stopped);
        }

        // The queue borrow must end before the task runs: tasks schedule more work.
        let next = {
            let mut queues = self.queues.borrow_mut();
            Priority::ALL
                .iter()
                .find_map(|p| queues[p.as_index()].pop_front().map(|task| (*p, task)))
        };

        let Some((priority, task)) = next else {
            return Ok(false);
        };

        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        {
            let mut stats = self.stats.borrow_mut();
            stats.dispatched += 1;
            stats.per_priority_dispatched[priority.as_index()] += 1;
            stats.max_depth = stats.max_depth.max(depth);
        }
        trace!(task = task.id.0, label = task.label, %priority, depth, "dispatch");
        (task.run)();
        self.depth.set(depth - 1);
        Ok(true)
    }

    /// Iterates until `completion` resolves and returns its value.
    pub fn run_until_complete<T>(&self, completion: &Completion<T>) -> LoopResult<T> {
        loop {
            if let Some(value) = completion.take() {
                return Ok(value);
            }
            if !self.iteration()? {
                if let Some(value) = completion.take() {
                    return Ok(value);
                }
                warn!(label = completion.label(), "main loop stalled");
                return Err(LoopError::Stalled {
                    label: completion.label(),
                });
            }
        }
    }

    /// Runs queued work until every tier is empty. Returns the number of
    /// dispatched tasks.
    pub fn drain(&self) -> LoopResult<u64> {
        let mut count = 0;
        while self.iteration()? {
            count += 1;
        }
        Ok(count)
    }

    /// Number of queued tasks across all tiers.
    pub fn pending(&self) -> usize {
        self.queues.borrow().iter().map(VecDeque::len).sum()
    }

    /// Number of queued tasks at one tier.
    pub fn pending_at(&self, priority: Priority) -> usize {
        self.queues.borrow()[priority.as_index()].len()
    }

    /// Current nesting depth of dispatch; zero outside any task.
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Stops the loop and drops every pending task. Returns how many were dropped.
    pub fn stop(&self) -> usize {
        self.running.set(false);
        let dropped: Vec<QueuedTask> = {
            let mut queues = self.queues.borrow_mut();
            queues.iter_mut().flat_map(|q| q.drain(..)).collect()
        };
        let count = dropped.len();
        self.stats.borrow_mut().dropped += count as u64;
        drop(dropped);
        debug!(dropped = count, "main loop stopped");
        count
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.borrow().clone()
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("running", &self.running.get())
            .field("pending", &self.pending())
            .field("depth", &self.depth.get())
            .finish()
    }
}

/// One-shot result slot shared between an operation and its waiter.
pub struct Completion<T> {
    slot: Rc<RefCell<Option<T>>>,
    resolved: Rc<Cell<bool>>,
    label: &'static str,
}

impl<T> Completion<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
            resolved: Rc::new(Cell::new(false)),
            label,
        }
    }

    /// Stores the result. Only the first resolution counts.
    pub fn resolve(&self, value: T) {
        if self.resolved.replace(true) {
            warn!(label = self.label, "completion resolved twice, keeping first result");
            return;
        }
        *self.slot.borrow_mut() = Some(value);
    }

    /// True once a result has been stored, even if it was already taken.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    /// Removes the stored result.
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
            resolved: Rc::clone(&self.resolved),
            label: self.label,
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("label", &self.label)
            .field("resolved", &self.resolved.get())
            .finish()
    }
}
