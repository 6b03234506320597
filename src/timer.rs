//! Dispatcher-hosted timers
//!
//! Timers are entries in a deadline heap drained by the dispatcher loop.
//! Every owner (connection inactivity, peer ping, peer retry) holds a
//! [`TimerHandle`] carrying a generation counter; arming bumps the
//! generation and records it in the heap entry, so canceling or re-arming
//! is just another bump. Stale entries are discarded when their deadline
//! comes up, which makes firing on a freed owner a structural no-op.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// Closure run on the dispatcher when a timer fires.
pub(crate) type TimerAction = Box<dyn FnOnce() + Send + 'static>;

/// Cancelable handle owned by the timed entity.
#[derive(Debug, Default)]
pub(crate) struct TimerHandle {
    gen: Arc<AtomicU64>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate any armed instance of this timer.
    pub fn cancel(&self) {
        self.gen.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Start a new arming: invalidates the previous instance and returns
    /// the token the heap entry must match at fire time.
    pub fn arm(&self) -> ArmToken {
        let gen = self.gen.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        ArmToken {
            gen,
            gen_ref: Arc::clone(&self.gen),
        }
    }
}

/// Generation snapshot for one armed timer instance.
pub(crate) struct ArmToken {
    gen: u64,
    gen_ref: Arc<AtomicU64>,
}

impl ArmToken {
    fn is_live(&self) -> bool {
        self.gen_ref.load(AtomicOrdering::SeqCst) == self.gen
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    token: ArmToken,
    action: TimerAction,
}

// BinaryHeap is a max-heap; reverse the ordering for earliest-first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Deadline heap owned by the dispatcher loop.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, token: ArmToken, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            token,
            action,
        });
    }

    /// Earliest deadline among live entries, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Drop stale heads so the dispatcher never sleeps on a dead timer.
        while let Some(entry) = self.heap.peek() {
            if entry.token.is_live() {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the actions of all live entries due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut due = Vec::new();
        while self.heap.peek().map_or(false, |e| e.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                if entry.token.is_live() {
                    // The fire itself consumes the arming, so a handler
                    // that re-arms from inside the action starts a fresh
                    // generation.
                    entry.token.gen_ref.fetch_add(1, AtomicOrdering::SeqCst);
                    due.push(entry.action);
                }
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
