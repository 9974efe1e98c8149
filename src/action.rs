//! Action / Partition Router (SPEC_FULL §4.7): decomposes a transaction
//! into a DAG of `Action`s, each routed to the worker owning the data
//! partition it touches, with per-key entry locks enforcing ordering
//! inside a partition.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;

use crate::error::CoreError;
use crate::queue::SrmwQueue;
use crate::rvp::Countdown;
use crate::stats::WorkerStats;
use crate::worker::{Worker, WorkingState};

/// The fixed, source-order table of action-type names whose lexicographic
/// rank governs lock-acquisition order across a partition (SPEC_FULL §9
/// "Global action acquisition order"). Precomputed once into integer ranks
/// rather than compared as strings at runtime.
const ACTION_TYPE_ORDER: &[&str] = &[
    "AGGREGATE",
    "BNL_IN",
    "BNL_JOIN",
    "FDUMP",
    "FSCAN",
    "FUNC_CALL",
    "HASH_JOIN",
    "MERGE",
    "PARTIAL_AGGREGATE",
    "HASH_AGGREGATE",
    "SORT",
    "SORTED_IN",
    "TSCAN",
];

static ACTION_TYPE_RANKS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    ACTION_TYPE_ORDER
        .iter()
        .enumerate()
        .map(|(rank, &name)| (name, rank as u32))
        .collect()
});

/// Looks up the precomputed rank for an action-type name, falling back to
/// "after everything named" for an unrecognized type rather than panicking.
pub fn action_type_rank(name: &str) -> u32 {
    *ACTION_TYPE_RANKS.get(name).unwrap_or(&(ACTION_TYPE_ORDER.len() as u32))
}

/// A single-key lock request declared by an action (SPEC_FULL §3 "Action").
#[derive(Clone)]
pub struct LockRequest {
    pub action_type: &'static str,
    pub key: Vec<u8>,
}

impl LockRequest {
    pub fn new(action_type: &'static str, key: Vec<u8>) -> LockRequest {
        LockRequest { action_type, key }
    }

    fn rank(&self) -> u32 {
        action_type_rank(self.action_type)
    }
}

/// The smallest unit of scheduled work: belongs to exactly one transaction
/// and one partition (SPEC_FULL §3 "Action").
pub struct Action {
    pub xct_id: u64,
    pub partition: usize,
    pub locks: Vec<LockRequest>,
    pub rvp: Arc<Countdown>,
    body: Box<dyn FnOnce() -> Result<(), CoreError> + Send>,
}

impl Action {
    pub fn new(
        xct_id: u64,
        partition: usize,
        locks: Vec<LockRequest>,
        rvp: Arc<Countdown>,
        body: impl FnOnce() -> Result<(), CoreError> + Send + 'static,
    ) -> Action {
        Action { xct_id, partition, locks, rvp, body: Box::new(body) }
    }

    fn sorted_locks(&self) -> Vec<LockRequest> {
        let mut locks = self.locks.clone();
        locks.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.key.cmp(&b.key)));
        locks
    }
}

#[derive(Default)]
struct KeyLock {
    held: bool,
    waiters: VecDeque<Action>,
}

/// Per-partition entry locks. A partition is served by exactly one worker
/// thread, so these locks exist to order actions whose key sets overlap
/// but that were dequeued before the earlier one finished (e.g. an action
/// re-queued after a wait) rather than to arbitrate true concurrent access.
#[derive(Default)]
struct PartitionLocks {
    keys: Mutex<HashMap<Vec<u8>, KeyLock>>,
}

impl PartitionLocks {
    /// Tries to acquire every lock the action declares, in fixed rank
    /// order. On success, returns the action so the caller can execute it
    /// immediately. On contention, parks the action on the first contended
    /// key's waiter list and returns it to the caller as `Err` so the
    /// caller knows not to execute it now.
    fn try_acquire(&self, action: Action) -> Result<Action, ()> {
        let sorted = action.sorted_locks();
        let mut keys = self.keys.lock().unwrap();
        let contended = sorted.iter().find(|l| keys.get(&l.key).map(|e| e.held).unwrap_or(false)).cloned();
        match contended {
            None => {
                for l in &sorted {
                    keys.entry(l.key.clone()).or_default().held = true;
                }
                Ok(action)
            }
            Some(l) => {
                keys.entry(l.key.clone()).or_default().waiters.push_back(action);
                Err(())
            }
        }
    }

    /// Releases every lock the action held, in reverse acquire order,
    /// re-queuing any waiter that becomes ready onto `requeue`.
    fn release(&self, action: &Action, requeue: &SrmwQueue<Action>) {
        let sorted = action.sorted_locks();
        let mut keys = self.keys.lock().unwrap();
        for l in sorted.iter().rev() {
            if let Some(entry) = keys.get_mut(&l.key) {
                entry.held = false;
                if let Some(waiter) = entry.waiters.pop_front() {
                    requeue.push(waiter, true);
                }
            }
        }
    }
}

struct Partition {
    queue: Arc<SrmwQueue<Action>>,
    worker: Arc<Worker>,
    locks: Arc<PartitionLocks>,
}

/// Routes actions to the worker owning their partition and runs each
/// partition's worker loop: dequeue, acquire locks, execute, release,
/// re-queue newly-ready waiters (SPEC_FULL §4.7).
pub struct PartitionRouter {
    partitions: Vec<Partition>,
}

impl PartitionRouter {
    /// Spins up `num_partitions` workers, each owning one `SrmwQueue<Action>`
    /// and one `PartitionLocks` table, and starts them in `Active` state.
    pub fn start(num_partitions: usize, loops_before_sleep: u32, wake_threshold: usize) -> Arc<PartitionRouter> {
        let mut partitions = Vec::with_capacity(num_partitions);
        for i in 0..num_partitions {
            let worker = Arc::new(Worker::new(format!("partition-worker-{}", i), None));
            let queue = Arc::new(SrmwQueue::new(
                worker.condex.clone(),
                worker.control.clone(),
                WorkingState::InputQ,
                loops_before_sleep,
                wake_threshold,
            ));
            let locks = Arc::new(PartitionLocks::default());
            partitions.push(Partition { queue, worker, locks });
        }

        let router = Arc::new(PartitionRouter { partitions });
        for i in 0..num_partitions {
            let queue = router.partitions[i].queue.clone();
            let locks = router.partitions[i].locks.clone();
            let worker = router.partitions[i].worker.clone();
            let mut stats = WorkerStats::default();
            worker.start(
                move || {
                    let action = match queue.pop(&mut stats) {
                        Some(a) => a,
                        None => return,
                    };
                    run_one_action(action, &locks, &queue);
                },
                move || {
                    debug!("partition worker stopping with possible in-flight work abandoned");
                },
            );
            router.partitions[i].worker.resume();
        }
        router
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Deterministically maps a key to a partition index (SPEC_FULL §4.7).
    pub fn route(&self, key: &[u8]) -> usize {
        let mut hash: u64 = 1469598103934665603; // FNV-1a offset basis
        for &b in key {
            hash ^= b as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash as usize) % self.partitions.len().max(1)
    }

    /// Submits `action` onto the queue of the worker owning `action.partition`.
    pub fn submit(&self, action: Action) {
        let partition = action.partition;
        self.partitions[partition].queue.push(action, false);
    }

    /// Stops and joins every partition worker. Any in-flight actions are
    /// abandoned; their RVPs are never posted (callers waiting on them
    /// should already be shutting down too).
    pub fn stop_all(&self) {
        for p in &self.partitions {
            p.worker.stop_and_join();
        }
    }
}

/// Runs one dequeued action to completion: tries to acquire its locks
/// (parking it on contention rather than executing), runs its body, posts
/// its RVP, and releases locks — feeding any now-ready waiter back onto the
/// partition's own queue.
fn run_one_action(action: Action, locks: &Arc<PartitionLocks>, queue: &Arc<SrmwQueue<Action>>) {
    let action = match locks.try_acquire(action) {
        Ok(a) => a,
        Err(()) => return,
    };
    let rvp = action.rvp.clone();
    let body = action.body;
    let sorted_locks = action.sorted_locks();
    let result = body();
    match &result {
        Ok(()) => {
            rvp.post(false);
        }
        Err(e) => {
            e.log_with_backtrace(&format!("action on xct {} failed", action.xct_id));
            rvp.post(true);
        }
    }
    // Reconstruct a lock-only handle for release bookkeeping (the body and
    // rvp have already been consumed).
    let release_handle = Action { xct_id: action.xct_id, partition: action.partition, locks: sorted_locks, rvp, body: Box::new(|| Ok(())) };
    locks.release(&release_handle, queue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[test]
    fn action_type_ranks_are_stable_and_ordered() {
        assert_eq!(action_type_rank("AGGREGATE"), 0);
        assert!(action_type_rank("TSCAN") > action_type_rank("AGGREGATE"));
        assert_eq!(action_type_rank("NOT_A_REAL_TYPE"), ACTION_TYPE_ORDER.len() as u32);
    }

    #[test]
    fn submit_runs_action_and_posts_rvp() {
        let router = PartitionRouter::start(2, 50, 0);
        let executed = Arc::new(AtomicUsize::new(0));
        let rvp = Arc::new(Countdown::new(1));
        let e = executed.clone();
        let action = Action::new(1, 0, vec![LockRequest::new("UPDATE", b"k1".to_vec())], rvp.clone(), move || {
            e.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        router.submit(action);

        let start = std::time::Instant::now();
        while rvp.remaining() != 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(executed.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(rvp.remaining(), 0);
        router.stop_all();
    }

    #[test]
    fn failing_action_poisons_rvp() {
        let router = PartitionRouter::start(1, 50, 0);
        let rvp = Arc::new(Countdown::new(1));
        let action = Action::new(2, 0, vec![], rvp.clone(), || Err(CoreError::TupleNotFound));
        router.submit(action);

        let start = std::time::Instant::now();
        while !rvp.is_errored() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(rvp.is_errored());
        router.stop_all();
    }

    #[test]
    fn contending_actions_on_same_key_both_eventually_run() {
        let router = PartitionRouter::start(1, 20, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let rvp_a = Arc::new(Countdown::new(1));
        let rvp_b = Arc::new(Countdown::new(1));

        let o1 = order.clone();
        let a = Action::new(3, 0, vec![LockRequest::new("UPDATE", b"shared".to_vec())], rvp_a.clone(), move || {
            std::thread::sleep(Duration::from_millis(20));
            o1.lock().unwrap().push('a');
            Ok(())
        });
        let o2 = order.clone();
        let b = Action::new(4, 0, vec![LockRequest::new("UPDATE", b"shared".to_vec())], rvp_b.clone(), move || {
            o2.lock().unwrap().push('b');
            Ok(())
        });
        router.submit(a);
        router.submit(b);

        let start = std::time::Instant::now();
        while (rvp_a.remaining() != 0 || rvp_b.remaining() != 0) && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b']);
        router.stop_all();
    }
}
