//! Keepalive scheduler: next expected heartbeat per session, ordered by
//! deadline so a sweep only looks at what has actually expired.
//!
//! Rescheduling pushes a fresh entry instead of searching the heap. The
//! `latest` map holds each session's current deadline; heap entries that no
//! longer match it are superseded and discarded when they surface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tether_core::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    id: SessionId,
}

/// Binary min-heap on `deadline`.
#[derive(Debug, Default)]
struct DeadlineHeap {
    entries: Vec<Entry>,
}

impl DeadlineHeap {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[i].deadline < self.entries[j].deadline
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
    }

    fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
        self.up(self.len() - 1);
    }

    fn pop(&mut self) -> Option<Entry> {
        let n = self.len().checked_sub(1)?;
        self.swap(0, n);
        self.down(0, n);
        self.entries.pop()
    }

    fn peek(&self) -> Option<&Entry> {
        self.entries.first()
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(j, parent) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    /// Sift down within the first `n` entries.
    fn down(&mut self, mut i: usize, n: usize) {
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: DeadlineHeap,
    latest: HashMap<SessionId, Instant>,
}

impl Inner {
    /// Discard superseded entries at the top of the heap.
    fn settle(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.latest.get(&top.id) == Some(&top.deadline) {
                return;
            }
            self.heap.pop();
        }
    }
}

pub struct KeepaliveScheduler {
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl KeepaliveScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Expect the next heartbeat from `id` within the timeout from `now`.
    pub fn schedule(&self, id: &str, now: Instant) -> Instant {
        let deadline = now + self.timeout;
        let mut inner = self.lock();
        inner.latest.insert(id.to_string(), deadline);
        inner.heap.push(Entry {
            deadline,
            id: id.to_string(),
        });
        deadline
    }

    /// Stop tracking `id`. Its heap entries become stale.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().latest.remove(id).is_some()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.lock();
        inner.settle();
        inner.heap.peek().map(|e| e.deadline)
    }

    /// Remove and return every session whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&self, now: Instant) -> Vec<SessionId> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        loop {
            inner.settle();
            match inner.heap.peek() {
                Some(top) if top.deadline <= now => {}
                _ => break,
            }
            if let Some(entry) = inner.heap.pop() {
                inner.latest.remove(&entry.id);
                expired.push(entry.id);
            }
        }
        expired
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.lock().latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
