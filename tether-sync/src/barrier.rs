//! Completion tracking for one upload session.
//!
//! The counter starts at one for the enumeration pass. Every unit of work
//! started during enumeration (a drained table/owner pair, a batch handed to
//! the transport) adds one and removes it when it settles. The session
//! resolves exactly once, when the count returns to zero after enumeration
//! has finished.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::SyncError;

/// Totals observed when the barrier resolved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchTally {
    pub committed: usize,
    pub failed: usize,
    pub records: usize,
}

#[derive(Debug)]
struct State {
    pending: usize,
    committed: usize,
    failed: usize,
    records: usize,
    first_error: Option<SyncError>,
    resolved: bool,
}

#[derive(Debug)]
pub struct CompletionBarrier {
    state: Mutex<State>,
    done: Notify,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: 1,
                committed: 0,
                failed: 0,
                records: 0,
                first_error: None,
                resolved: false,
            }),
            done: Notify::new(),
        }
    }

    /// Register a unit of work about to start.
    pub fn enter(&self) {
        let mut state = self.lock();
        debug_assert!(!state.resolved, "batch entered after resolution");
        state.pending += 1;
    }

    /// Settle one batch. `Ok(n)` means `n` records were committed.
    pub fn leave_batch(&self, result: Result<usize, SyncError>) {
        let mut state = self.lock();
        match result {
            Ok(records) => {
                state.committed += 1;
                state.records += records;
            }
            Err(e) => {
                state.failed += 1;
                if state.first_error.is_none() {
                    state.first_error = Some(e);
                }
            }
        }
        self.decrement(&mut state);
    }

    /// Settle a unit that is not itself a batch.
    pub fn leave(&self) {
        let mut state = self.lock();
        self.decrement(&mut state);
    }

    /// Mark enumeration finished. Call exactly once.
    pub fn close(&self) {
        self.leave();
    }

    /// Wait for resolution. The first recorded failure wins; every batch
    /// that succeeded is still counted.
    pub async fn wait(&self) -> Result<BatchTally, SyncError> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.resolved {
                    let tally = BatchTally {
                        committed: state.committed,
                        failed: state.failed,
                        records: state.records,
                    };
                    return match state.first_error.take() {
                        None => Ok(tally),
                        Some(first) => Err(SyncError::PartialCommit {
                            first: Box::new(first),
                            committed_batches: tally.committed,
                            failed_batches: tally.failed,
                        }),
                    };
                }
            }
            notified.await;
        }
    }

    pub fn tally(&self) -> BatchTally {
        let state = self.lock();
        BatchTally {
            committed: state.committed,
            failed: state.failed,
            records: state.records,
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    fn decrement(&self, state: &mut State) {
        debug_assert!(state.pending > 0, "barrier decremented below zero");
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 && !state.resolved {
            state.resolved = true;
            self.done.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking batch task must not wedge the session.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
