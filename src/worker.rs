//! The `Worker` state machine and its `Condex` sleep/wake discipline
//! (SPEC_FULL §4.5, §9 "Worker condex discipline").

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::stats::{bind_to_processor, WorkerStats};

/// A worker's lifecycle control word (SPEC_FULL §3). Transitions form a
/// DAG: `Paused <-> Active`, either `-> Stopped`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    Paused = 0,
    Active = 1,
    Stopped = 2,
}

impl Control {
    fn from_u8(v: u8) -> Control {
        match v {
            0 => Control::Paused,
            1 => Control::Active,
            _ => Control::Stopped,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    fn can_transition_to(self, next: Control) -> bool {
        matches!(
            (self, next),
            (Control::Paused, Control::Active)
                | (Control::Active, Control::Paused)
                | (Control::Paused, Control::Stopped)
                | (Control::Active, Control::Stopped)
        )
    }
}

/// A worker's per-pass working-state tag (SPEC_FULL §3). Sleeping is only
/// legal from `Loop`; any write here must preserve that invariant or a
/// wake-up is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingState {
    Undef,
    /// Just finished one pass over its queue(s) with nothing left to do.
    Loop,
    Sleep,
    CommitQ,
    InputQ,
    Finished,
}

/// The `(Mutex<WorkingState>, Condvar)` pair a worker sleeps on between
/// `Loop` passes (glossary: "Condex").
pub struct Condex {
    state: Mutex<WorkingState>,
    cv: Condvar,
}

impl Default for Condex {
    fn default() -> Self {
        Self::new()
    }
}

impl Condex {
    pub fn new() -> Condex {
        Condex { state: Mutex::new(WorkingState::Undef), cv: Condvar::new() }
    }

    pub fn working_state(&self) -> WorkingState {
        *self.state.lock().unwrap()
    }

    /// Atomically updates the working-state tag, signalling the condvar
    /// iff the old tag was `Sleep` (SPEC_FULL §4.5 "Wake discipline").
    pub fn set_working_state(&self, ws: WorkingState) {
        let mut guard = self.state.lock().unwrap();
        let old = *guard;
        *guard = ws;
        if old == WorkingState::Sleep {
            drop(guard);
            self.cv.notify_all();
        }
    }

    /// Rechecks `Loop` under the lock, flips to `Sleep`, and waits. Rejects
    /// sleeping from any other tag, since that would be a lost wake-up
    /// (SPEC_FULL §9), bumping `stats.failed_sleep` for the rejected
    /// attempt. Increments `stats.condex_sleep` only once the wait actually
    /// returns, not when it's entered.
    pub fn condex_sleep(&self, stats: &mut WorkerStats) {
        let mut guard = self.state.lock().unwrap();
        if *guard != WorkingState::Loop {
            stats.failed_sleep += 1;
            return;
        }
        *guard = WorkingState::Sleep;
        while *guard == WorkingState::Sleep {
            guard = self.cv.wait(guard).unwrap();
        }
        stats.condex_sleep += 1;
    }
}

/// Shared, atomically-readable lifecycle control for a worker. Cloned into
/// every `SrmwQueue` the worker owns so pushers and the worker's own loop
/// observe the same STOPPED signal without a second lock.
#[derive(Clone)]
pub struct WorkerControl {
    word: Arc<AtomicU8>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> WorkerControl {
        WorkerControl { word: Arc::new(AtomicU8::new(Control::Paused as u8)) }
    }

    pub fn get(&self) -> Control {
        Control::from_u8(self.word.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == Control::Stopped
    }

    /// Attempts the transition, logging and ignoring illegal ones
    /// (SPEC_FULL §4.5 "Transition rules").
    pub fn transition(&self, next: Control) {
        let current = self.get();
        if !current.can_transition_to(next) {
            warn!("ignoring illegal worker transition {:?} -> {:?}", current, next);
            return;
        }
        self.word.store(next as u8, Ordering::Release);
    }
}

/// A named, long-lived worker thread bound to one partition (SPEC_FULL
/// §4.5). `Worker` itself only owns the state machine and condex; the work
/// loop body (queue service) is supplied by the caller's `run` closure so
/// this type can drive both the partition router's workers and the
/// flusher's single worker.
pub struct Worker {
    pub name: String,
    pub control: WorkerControl,
    pub condex: Arc<Condex>,
    pub cpu_id: Option<u32>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, cpu_id: Option<u32>) -> Worker {
        Worker {
            name: name.into(),
            control: WorkerControl::new(),
            condex: Arc::new(Condex::new()),
            cpu_id,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the worker's OS thread. `body` is called in a loop: once per
    /// `Active` pass (should service the queue(s) until empty, then return
    /// so the main loop can recheck control), and is skipped entirely while
    /// `Paused`/`Stopped`. `on_stop` runs once, after the loop exits, to
    /// drain and abort any in-flight work (SPEC_FULL §4.5 main loop step 2).
    pub fn start<F, G>(self: &Arc<Worker>, mut body: F, mut on_stop: G)
    where
        F: FnMut() + Send + 'static,
        G: FnMut() + Send + 'static,
    {
        let worker = Arc::clone(self);
        let join = thread::spawn(move || {
            if let Some(cpu) = worker.cpu_id {
                bind_to_processor(cpu);
            }
            loop {
                match worker.control.get() {
                    Control::Active => {
                        body();
                    }
                    Control::Paused => {
                        thread::sleep(Duration::from_secs(1));
                    }
                    Control::Stopped => {
                        debug!("worker {} stopping", worker.name);
                        on_stop();
                        worker.condex.set_working_state(WorkingState::Finished);
                        info!("worker {} exited", worker.name);
                        break;
                    }
                }
            }
        });
        *self.handle.lock().unwrap() = Some(join);
    }

    pub fn resume(&self) {
        self.control.transition(Control::Active);
        self.condex.set_working_state(WorkingState::Loop);
    }

    pub fn pause(&self) {
        self.control.transition(Control::Paused);
    }

    /// Requests STOPPED and joins the underlying thread. Idempotent.
    pub fn stop_and_join(&self) {
        self.control.transition(Control::Stopped);
        self.condex.set_working_state(WorkingState::Finished);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                warn!("worker {} thread panicked during join: {:?}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn illegal_transition_is_ignored() {
        let control = WorkerControl::new();
        control.transition(Control::Stopped);
        assert_eq!(control.get(), Control::Stopped);
        // Stopped is terminal: Active is illegal from here.
        control.transition(Control::Active);
        assert_eq!(control.get(), Control::Stopped);
    }

    #[test]
    fn paused_active_round_trip() {
        let control = WorkerControl::new();
        control.transition(Control::Active);
        assert_eq!(control.get(), Control::Active);
        control.transition(Control::Paused);
        assert_eq!(control.get(), Control::Paused);
    }

    #[test]
    fn condex_sleep_rejects_non_loop_state() {
        let condex = Condex::new();
        let mut stats = WorkerStats::default();
        condex.set_working_state(WorkingState::Undef);
        condex.condex_sleep(&mut stats);
        assert_eq!(stats.condex_sleep, 0);
        assert_eq!(stats.failed_sleep, 1);
    }

    #[test]
    fn start_drives_worker_to_active_and_stop_joins() {
        let worker = Arc::new(Worker::new("w", None));
        let processed = Arc::new(AtomicUsize::new(0));
        let p = processed.clone();
        worker.start(
            move || {
                p.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            },
            || {},
        );
        worker.resume();

        let start = Instant::now();
        while processed.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(processed.load(Ordering::SeqCst) > 0);

        worker.stop_and_join();
        assert_eq!(worker.control.get(), Control::Stopped);
    }

    #[test]
    fn stop_runs_on_stop_hook() {
        let worker = Arc::new(Worker::new("w2", None));
        let stopped = Arc::new(AtomicBool::new(false));
        let s = stopped.clone();
        worker.start(|| thread::sleep(Duration::from_millis(1)), move || s.store(true, Ordering::SeqCst));
        worker.resume();
        thread::sleep(Duration::from_millis(10));
        worker.stop_and_join();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
