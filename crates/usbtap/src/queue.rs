//! Fixed-capacity FIFO of in-flight transfer records.
//!
//! One queue sits between each pipeline's reader and writer. Enqueue blocks
//! when full so a slow consumer throttles its producer instead of growing
//! memory; both ends unblock promptly when the queue is closed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::usb::{Direction, MAX_TRANSFER};

/// One unit of forwarded traffic.
///
/// Payload ownership moves with the record: the producer builds it, the
/// consumer takes it, nothing is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub data: Vec<u8>,
    pub direction: Direction,
    /// Monotonic within the endpoint this record belongs to.
    pub seq: u64,
    /// Set by the writer once the injection engine rewrote the payload.
    pub transformed: bool,
}

impl Transfer {
    pub fn new(data: Vec<u8>, direction: Direction, seq: u64) -> Self {
        debug_assert!(data.len() <= MAX_TRANSFER);
        Self {
            data,
            direction,
            seq,
            transformed: false,
        }
    }
}

/// Returned by [`TransferQueue::push`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

struct State {
    items: VecDeque<Transfer>,
    closed: bool,
}

pub struct TransferQueue {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl TransferQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until there is room, then enqueue. Returns [`QueueClosed`] once
    /// the queue has been closed, dropping the record.
    pub fn push(&self, transfer: Transfer) -> std::result::Result<(), QueueClosed> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self.writable.wait(state).unwrap();
        }
        state.items.push_back(transfer);
        self.readable.notify_one();
        Ok(())
    }

    /// Block until a record is available. Returns `None` once closed;
    /// records still queued at close time are dropped, not drained --
    /// shutdown wins over delivery.
    pub fn pop(&self) -> Option<Transfer> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return None;
            }
            if let Some(transfer) = state.items.pop_front() {
                self.writable.notify_one();
                return Some(transfer);
            }
            state = self.readable.wait(state).unwrap();
        }
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.items.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }
}
