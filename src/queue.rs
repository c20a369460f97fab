//! bounded work queue between the ingest thread and the writer worker
//!
//! strict FIFO: the writer pops in push order, which is what makes file
//! offsets recorded at write time line up with enqueue order. capacity
//! bounds the number of blocks compressing in flight.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// blocking single-producer/single-consumer FIFO with explicit shutdown
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                finished: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// default capacity: hardware parallelism + 2, floor 6
    pub fn default_capacity() -> usize {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (threads + 2).max(6)
    }

    /// enqueue, blocking while the queue is full
    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= self.capacity {
            state = self.not_full.wait(state).unwrap();
        }
        debug_assert!(!state.finished, "push after finish");
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
    }

    /// dequeue, blocking while empty; `None` once finished and drained
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.finished {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// mark the stream complete; idempotent
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        drop(state);
        self.not_empty.notify_all();
    }
}
