//! Single-reader, multi-writer queue (SPEC_FULL §4.4): writers append to
//! `for_writers` under a mutex; the single designated reader swaps vectors
//! and drains `for_readers` without holding the lock across the drain.
//!
//! Kept separate from a generic MPMC channel deliberately (§9 "SRMW queue
//! vs MPMC channel"): the reader's identity is load-bearing, since waking
//! it is what drives its owning worker's `Condex` out of `Sleep`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::stats::WorkerStats;
use crate::worker::{Condex, WorkerControl, WorkingState};

struct Inner<T> {
    for_writers: VecDeque<T>,
    for_readers: VecDeque<T>,
    empty: bool,
}

/// A queue of `T` owned by exactly one reading worker. `wake_state` is the
/// working-state tag `push` installs on the owner's `Condex` to pull it out
/// of `Sleep` — distinguishing, for a worker that serves more than one
/// queue, which queue just gained work.
pub struct SrmwQueue<T> {
    inner: Mutex<Inner<T>>,
    condex: Arc<Condex>,
    control: WorkerControl,
    wake_state: WorkingState,
    loops_before_sleep: u32,
    wake_threshold: usize,
    switch_requested: AtomicBool,
}

impl<T> SrmwQueue<T> {
    pub fn new(
        condex: Arc<Condex>,
        control: WorkerControl,
        wake_state: WorkingState,
        loops_before_sleep: u32,
        wake_threshold: usize,
    ) -> SrmwQueue<T> {
        SrmwQueue {
            inner: Mutex::new(Inner { for_writers: VecDeque::new(), for_readers: VecDeque::new(), empty: true }),
            condex,
            control,
            wake_state,
            loops_before_sleep: loops_before_sleep.max(1),
            wake_threshold,
            switch_requested: AtomicBool::new(false),
        }
    }

    /// Appends `item`; outside the mutex, wakes the owner out of `Sleep`
    /// if the writer-side backlog exceeds `wake_threshold` or `wake_hint`
    /// is set.
    pub fn push(&self, item: T, wake_hint: bool) {
        let size = {
            let mut inner = self.inner.lock().unwrap();
            inner.for_writers.push_back(item);
            inner.empty = false;
            inner.for_writers.len()
        };
        if size > self.wake_threshold || wake_hint {
            self.condex.set_working_state(self.wake_state);
        }
    }

    pub fn len_hint(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.for_readers.len() + inner.for_writers.len()
    }

    /// Tells the owning worker's next `wait_for_input` to bail out early so
    /// it can go service a different queue (SPEC_FULL §4.4).
    pub fn request_switch(&self) {
        self.switch_requested.store(true, Ordering::Release);
    }

    fn take_switch_request(&self) -> bool {
        self.switch_requested.swap(false, Ordering::AcqRel)
    }

    /// Pops the next element in push order, blocking (spin-then-sleep) when
    /// empty. Only the owning worker thread may call this.
    pub fn pop(&self, stats: &mut WorkerStats) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.for_readers.pop_front() {
                    return Some(item);
                }
            }
            if !self.wait_for_input(stats) {
                return None;
            }
        }
    }

    /// Spins up to `loops_before_sleep` times checking for new input (via a
    /// vector swap when the writer side is non-empty), then sleeps on the
    /// condex. Returns `false` on STOPPED or a switch request.
    fn wait_for_input(&self, stats: &mut WorkerStats) -> bool {
        let mut spins = 0u32;
        loop {
            if self.control.is_stopped() {
                return false;
            }
            if self.take_switch_request() {
                return false;
            }
            if self.try_swap() {
                return true;
            }
            spins += 1;
            if spins >= self.loops_before_sleep {
                self.condex.set_working_state(WorkingState::Loop);
                self.condex.condex_sleep(stats);
                spins = 0;
                if self.control.is_stopped() {
                    return false;
                }
                if self.try_swap() {
                    return true;
                }
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Non-blocking pop: returns `None` immediately rather than sleeping if
    /// nothing is currently available.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.for_readers.pop_front() {
            return Some(item);
        }
        if !inner.empty {
            std::mem::swap(&mut inner.for_readers, &mut inner.for_writers);
            inner.for_writers.clear();
            inner.empty = true;
        }
        inner.for_readers.pop_front()
    }

    /// Drains everything currently available without blocking. Used by the
    /// flusher to batch a whole backlog before a single `flushlog` call.
    pub fn drain_available(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.try_pop() {
            out.push(item);
        }
        out
    }

    /// Swaps `for_readers`/`for_writers` if the writer side has anything,
    /// returning whether the reader now has data to serve.
    fn try_swap(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.for_readers.is_empty() {
            return true;
        }
        if inner.empty {
            return false;
        }
        std::mem::swap(&mut inner.for_readers, &mut inner.for_writers);
        inner.for_writers.clear();
        inner.empty = true;
        !inner.for_readers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Control;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn queue(loops_before_sleep: u32) -> (Arc<SrmwQueue<u32>>, WorkerControl) {
        let control = WorkerControl::new();
        control.transition(Control::Active);
        let q = Arc::new(SrmwQueue::new(Arc::new(Condex::new()), control.clone(), WorkingState::InputQ, loops_before_sleep, 0));
        (q, control)
    }

    #[test]
    fn single_writer_fifo_order() {
        let (q, _control) = queue(100);
        for i in 0..10 {
            q.push(i, false);
        }
        let mut stats = WorkerStats::default();
        let drained: Vec<u32> = (0..10).map(|_| q.pop(&mut stats).unwrap()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn pop_blocks_until_push_then_consumes() {
        let (q, _control) = queue(100);
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();
            q2.pop(&mut stats)
        });
        thread::sleep(Duration::from_millis(20));
        q.push(42, true);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn pop_returns_none_on_stop() {
        let (q, control) = queue(5);
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();
            q2.pop(&mut stats)
        });
        thread::sleep(Duration::from_millis(10));
        control.transition(Control::Stopped);
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn drain_available_batches_without_blocking() {
        let (q, _control) = queue(100);
        assert!(q.drain_available().is_empty());
        for i in 0..5 {
            q.push(i, false);
        }
        assert_eq!(q.drain_available(), vec![0, 1, 2, 3, 4]);
        assert!(q.drain_available().is_empty());
    }

    #[test]
    fn wake_after_sleep_keeps_failed_sleep_at_zero() {
        let (q, _control) = queue(50);
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            let mut stats = WorkerStats::default();
            let item = q2.pop(&mut stats);
            (item, stats)
        });
        // Give the reader time to spin out and go to sleep.
        thread::sleep(Duration::from_millis(30));
        q.push(7, true);
        let (item, stats) = handle.join().unwrap();
        assert_eq!(item, Some(7));
        assert_eq!(stats.failed_sleep, 0);
    }
}
