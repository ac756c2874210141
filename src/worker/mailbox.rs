//! Blocking FIFO used for every cross-thread hop.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

struct MailboxState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer queue with a single blocking consumer.
///
/// Items pushed by one producer are drained in push order. Once closed, the
/// mailbox refuses new items but still hands out what was already queued.
pub struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    ready: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                items: VecDeque::with_capacity(16),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Queue an item. Returns `false` (and drops the item) once closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.ready.notify_one();
        true
    }

    /// Take everything queued so far without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Block until something is queued, the mailbox is closed, or `timeout`
    /// elapses (`None` waits indefinitely), then drain.
    pub fn wait(&self, timeout: Option<Duration>) -> Vec<T> {
        let mut state = self.state.lock();
        if state.items.is_empty() && !state.closed {
            match timeout {
                Some(timeout) => {
                    let _ = self.ready.wait_for(&mut state, timeout);
                }
                None => {
                    while state.items.is_empty() && !state.closed {
                        self.ready.wait(&mut state);
                    }
                }
            }
        }
        state.items.drain(..).collect()
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}
