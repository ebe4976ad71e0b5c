//! Parameterless wake primitive with coalescing rings.

use std::sync::{Condvar, Mutex};

/// A doorbell carries no state of its own: ringing bumps a generation
/// counter and wakes every waiter, and waiters re-check their predicate
/// after waking. Ringing an already-signaled doorbell is idempotent for a
/// waiter that has not yet observed the earlier ring.
///
/// To avoid losing a ring that arrives between evaluating a predicate and
/// going to sleep, take a [Doorbell::sequence] snapshot first, evaluate,
/// and sleep with [Doorbell::wait_from]; any ring after the snapshot makes
/// the wait return immediately.
#[derive(Debug, Default)]
pub struct Doorbell {
    sequence: Mutex<u64>,
    condvar: Condvar,
}

impl Doorbell {
    /// Creates an unrung doorbell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rings the doorbell, waking every waiter.
    pub fn ring(&self) {
        let mut sequence = self.sequence.lock().unwrap();
        *sequence += 1;
        drop(sequence);
        self.condvar.notify_all();
    }

    /// Returns the current ring sequence, to be passed to
    /// [Doorbell::wait_from] after evaluating the wait predicate.
    pub fn sequence(&self) -> u64 {
        *self.sequence.lock().unwrap()
    }

    /// Blocks until the doorbell has been rung after the `seen` snapshot
    /// was taken. Returns immediately if it already has been.
    pub fn wait_from(&self, seen: u64) {
        let mut sequence = self.sequence.lock().unwrap();
        while *sequence == seen {
            sequence = self.condvar.wait(sequence).unwrap();
        }
    }
}
