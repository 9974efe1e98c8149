//! Rendez-vous point / `Countdown` (SPEC_FULL §4.6): an atomic N-of-M join
//! fired when every parallel sub-action of a transaction has posted.
//!
//! The whole thing lives in one 32-bit atomic word: `state = remaining *
//! UNIT`, with `UNIT = 2` and a distinguished `ERROR_SENTINEL = 1` so the
//! poisoned state can never alias a valid remaining-count (every valid
//! `state` is even, per SPEC_FULL §9 "RVP bit layout").

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{CoreError, CoreResult};

pub const UNIT: u32 = 2;
pub const ERROR_SENTINEL: u32 = 1;

/// An atomic N-of-M countdown. `post` is called once per child action;
/// exactly one caller — the one that drives `state` to its terminal value,
/// whether that's a clean `0` or the poisoned sentinel — observes the
/// "last post" and gets `true` back.
#[derive(Debug)]
pub struct Countdown {
    state: AtomicU32,
}

impl Countdown {
    pub fn new(n: u32) -> Countdown {
        Countdown { state: AtomicU32::new(n * UNIT) }
    }

    /// Posts one completion. `error` marks this poster's sub-action as
    /// failed, immediately poisoning the countdown for every future caller.
    /// Returns `true` iff this call was the one that observed the terminal
    /// transition (i.e., it is responsible for driving the continuation —
    /// handing off to the flusher on success, or propagating the error).
    pub fn post(&self, error: bool) -> bool {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s >= 2 * UNIT {
                let new = if error { ERROR_SENTINEL } else { s - UNIT };
                if self
                    .state
                    .compare_exchange(s, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Not the last post: whether this one errored or not,
                    // remaining posts still owe a call.
                    return false;
                }
                continue;
            }
            if s == ERROR_SENTINEL {
                return false;
            }
            if s == UNIT {
                let new = if error { ERROR_SENTINEL } else { 0 };
                if self
                    .state
                    .compare_exchange(s, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            // s == 0: countdown already completed.
            return false;
        }
    }

    /// `-1` once poisoned, else the number of sub-actions still outstanding.
    pub fn remaining(&self) -> i64 {
        let s = self.state.load(Ordering::Acquire);
        if s == ERROR_SENTINEL {
            -1
        } else {
            (s / UNIT) as i64
        }
    }

    pub fn is_errored(&self) -> bool {
        self.state.load(Ordering::Acquire) == ERROR_SENTINEL
    }

    /// Re-arms the countdown for `n` new posts. Only legal once the
    /// countdown has reached a terminal state (`0` or poisoned).
    pub fn reset(&self, n: u32) -> CoreResult<()> {
        let s = self.state.load(Ordering::Acquire);
        if s != 0 && s != ERROR_SENTINEL {
            return Err(CoreError::DispatcherError(
                "Countdown::reset called while posts are still outstanding".to_string(),
            ));
        }
        self.state.store(n * UNIT, Ordering::Release);
        Ok(())
    }
}
