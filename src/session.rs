//! `Session`: drives one client transaction end to end (SPEC_FULL §4.2) —
//! submits its `Action`s, waits on their RVP, retries on a retryable abort
//! up to `Config::max_retries`, then hands the committed transaction to the
//! `Flusher` and waits for durability before returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::action::{Action, PartitionRouter};
use crate::error::{CoreError, CoreResult};
use crate::flusher::Flusher;
use crate::rvp::Countdown;
use crate::storage_manager::{StorageManager, XctId};

/// Builds the one-shot `Action`s for a single attempt of one transaction
/// type. Called again on every retry, since an `Action`'s body is consumed
/// the moment it runs. Implementations whose action bodies can fail should
/// record the `CoreError` into `error_slot` before posting their RVP with
/// `error = true`, so `Session::execute` can classify retryable vs. fatal.
pub trait ActionFactory: Send + Sync {
    /// Short, stable name used for the per-type counters in `SessionStats`
    /// (e.g. "NEW_ORDER", "PAYMENT").
    fn name(&self) -> &'static str;

    fn build(
        &self,
        xct: XctId,
        rvp: Arc<Countdown>,
        error_slot: Arc<Mutex<Option<CoreError>>>,
    ) -> CoreResult<Vec<Action>>;
}

/// Running counters for one transaction type (SPEC_FULL §6.1 "STATS").
#[derive(Debug, Default, Clone, Copy)]
pub struct TrxCounters {
    pub attempted: u64,
    pub committed: u64,
    pub aborted: u64,
    pub retried: u64,
}

/// Per-transaction-type counters, shared across every `Session` driving the
/// same workload so the shell's `STATS` command can report totals.
#[derive(Default)]
pub struct SessionStats {
    by_type: Mutex<HashMap<&'static str, TrxCounters>>,
}

impl SessionStats {
    pub fn snapshot(&self, name: &str) -> TrxCounters {
        self.by_type.lock().unwrap().get(name).copied().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<(String, TrxCounters)> {
        self.by_type.lock().unwrap().iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn record(&self, name: &'static str, f: impl FnOnce(&mut TrxCounters)) {
        let mut map = self.by_type.lock().unwrap();
        f(map.entry(name).or_default());
    }
}

pub struct Session {
    sm: Arc<dyn StorageManager>,
    router: Arc<PartitionRouter>,
    flusher: Arc<Flusher>,
    max_retries: u32,
    stats: Arc<SessionStats>,
}

impl Session {
    pub fn new(
        sm: Arc<dyn StorageManager>,
        router: Arc<PartitionRouter>,
        flusher: Arc<Flusher>,
        max_retries: u32,
    ) -> Session {
        Session { sm, router, flusher, max_retries, stats: Arc::new(SessionStats::default()) }
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Runs `factory` to completion, retrying retryable aborts and blocking
    /// until the commit is both agreed (RVP) and durable (flusher RVP).
    pub fn execute(&self, factory: &dyn ActionFactory) -> CoreResult<()> {
        self.stats.record(factory.name(), |c| c.attempted += 1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let xct = self.sm.begin_xct();
            let error_slot = Arc::new(Mutex::new(None));
            // Built in the always-terminal state 0, then re-armed to the
            // real fan-out once `build` tells us how many actions there are.
            let rvp = Arc::new(Countdown::new(0));

            let actions = match factory.build(xct, rvp.clone(), error_slot.clone()) {
                Ok(a) => a,
                Err(e) => {
                    self.sm.abort_xct(xct).ok();
                    return Err(e);
                }
            };

            if actions.is_empty() {
                self.sm.commit_xct(xct)?;
                self.stats.record(factory.name(), |c| c.committed += 1);
                return self.await_durability(xct);
            }

            rvp.reset(actions.len() as u32).expect("freshly-built rvp has no outstanding posts");
            for action in actions {
                self.router.submit(action);
            }
            self.spin_wait(|| rvp.remaining() == 0 || rvp.is_errored());

            if !rvp.is_errored() {
                self.sm.commit_xct(xct)?;
                self.stats.record(factory.name(), |c| c.committed += 1);
                return self.await_durability(xct);
            }

            self.sm.abort_xct(xct).ok();
            self.stats.record(factory.name(), |c| c.aborted += 1);
            let cause = error_slot
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| CoreError::Retryable("action failed without recording a cause".to_string()));

            if !cause.is_retryable() {
                return Err(cause);
            }
            if attempt >= self.max_retries.max(1) {
                return Err(CoreError::MaxRetriesExceeded);
            }
            self.stats.record(factory.name(), |c| c.retried += 1);
            debug!("retrying {} (attempt {}) after: {}", factory.name(), attempt, cause);
        }
    }

    /// Hands a just-committed `xct` to the flusher and blocks until its
    /// commit record is durable (SPEC_FULL §4.8).
    fn await_durability(&self, xct: XctId) -> CoreResult<()> {
        let flush_rvp = Arc::new(Countdown::new(1));
        self.flusher.submit(xct, flush_rvp.clone());
        self.spin_wait(|| flush_rvp.remaining() == 0 || flush_rvp.is_errored());
        if flush_rvp.is_errored() {
            Err(CoreError::StorageManager("flush failed for an already-committed transaction".to_string()))
        } else {
            Ok(())
        }
    }

    /// Spin-then-sleep wait, mirroring the worker's own wake discipline:
    /// cheap while the answer is imminent, considerate of the CPU once it
    /// is not.
    fn spin_wait(&self, done: impl Fn() -> bool) {
        let mut spins = 0u32;
        while !done() {
            spins += 1;
            if spins < 1000 {
                std::hint::spin_loop();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::LockRequest;
    use crate::storage_manager::MemStorageManager;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysSucceeds;
    impl ActionFactory for AlwaysSucceeds {
        fn name(&self) -> &'static str {
            "ALWAYS_OK"
        }
        fn build(
            &self,
            xct: XctId,
            rvp: Arc<Countdown>,
            _error_slot: Arc<Mutex<Option<CoreError>>>,
        ) -> CoreResult<Vec<Action>> {
            Ok(vec![Action::new(xct, 0, vec![], rvp, || Ok(()))])
        }
    }

    struct FailsThenSucceeds {
        remaining_failures: Arc<AtomicU32>,
    }
    impl ActionFactory for FailsThenSucceeds {
        fn name(&self) -> &'static str {
            "FLAKY"
        }
        fn build(
            &self,
            xct: XctId,
            rvp: Arc<Countdown>,
            error_slot: Arc<Mutex<Option<CoreError>>>,
        ) -> CoreResult<Vec<Action>> {
            let remaining = self.remaining_failures.clone();
            Ok(vec![Action::new(xct, 0, vec![LockRequest::new("UPDATE", b"k".to_vec())], rvp, move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                    *error_slot.lock().unwrap() = Some(CoreError::Retryable("simulated conflict".to_string()));
                    Err(CoreError::Retryable("simulated conflict".to_string()))
                } else {
                    Ok(())
                }
            })]))
        }
    }

    struct AlwaysFatal;
    impl ActionFactory for AlwaysFatal {
        fn name(&self) -> &'static str {
            "FATAL"
        }
        fn build(
            &self,
            xct: XctId,
            rvp: Arc<Countdown>,
            error_slot: Arc<Mutex<Option<CoreError>>>,
        ) -> CoreResult<Vec<Action>> {
            Ok(vec![Action::new(xct, 0, vec![], rvp, move || {
                *error_slot.lock().unwrap() = Some(CoreError::TupleNotFound);
                Err(CoreError::TupleNotFound)
            })])
        }
    }

    fn make_session() -> Session {
        let sm: Arc<dyn StorageManager> = Arc::new(MemStorageManager::new());
        let router = PartitionRouter::start(1, 20, 0);
        let flusher = Flusher::start(sm.clone(), 20, 0);
        Session::new(sm, router, flusher, 3)
    }

    #[test]
    fn successful_transaction_commits_and_becomes_durable() {
        let session = make_session();
        assert!(session.execute(&AlwaysSucceeds).is_ok());
        assert_eq!(session.stats().snapshot("ALWAYS_OK").committed, 1);
    }

    #[test]
    fn retryable_failure_is_retried_until_success() {
        let session = make_session();
        let factory = FailsThenSucceeds { remaining_failures: Arc::new(AtomicU32::new(2)) };
        assert!(session.execute(&factory).is_ok());
        let counters = session.stats().snapshot("FLAKY");
        assert_eq!(counters.committed, 1);
        assert_eq!(counters.retried, 2);
    }

    #[test]
    fn retryable_failure_past_max_retries_gives_up() {
        let session = make_session();
        let factory = FailsThenSucceeds { remaining_failures: Arc::new(AtomicU32::new(10)) };
        let result = session.execute(&factory);
        assert!(matches!(result, Err(CoreError::MaxRetriesExceeded)));
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let session = make_session();
        let result = session.execute(&AlwaysFatal);
        assert!(matches!(result, Err(CoreError::TupleNotFound)));
        assert_eq!(session.stats().snapshot("FATAL").retried, 0);
    }
}
