//! Shared leases on a subsystem that must be running while anyone uses it.
//!
//! The first acquirer triggers one asynchronous "is it running?" probe.
//! Acquirers arriving while that probe is in flight wait on it instead of
//! starting their own, and all of them learn the same answer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::LeaseError;

/// A dependency whose availability can be probed.
#[async_trait]
pub trait Subsystem: Send + Sync + 'static {
    async fn is_running(&self) -> bool;
}

/// Caller identity for lease accounting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub String);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ListenerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

type Waiter = (ListenerId, oneshot::Sender<Result<(), LeaseError>>);

#[derive(Default)]
struct LeaseState {
    active: BTreeMap<ListenerId, usize>,
    pending: Vec<Waiter>,
    probing: bool,
}

impl LeaseState {
    fn total(&self) -> usize {
        self.active.values().sum()
    }

    fn grant(&mut self, listener: ListenerId) {
        *self.active.entry(listener).or_insert(0) += 1;
    }
}

struct Inner<S> {
    subsystem: S,
    probe_timeout: Duration,
    state: Mutex<LeaseState>,
}

impl<S> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reference counter over a [`Subsystem`].
///
/// While at least one lease is held the subsystem is treated as running and
/// no further probes are issued.
pub struct ServiceRefCounter<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ServiceRefCounter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Subsystem> ServiceRefCounter<S> {
    pub fn new(subsystem: S, probe_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                subsystem,
                probe_timeout,
                state: Mutex::new(LeaseState::default()),
            }),
        }
    }

    /// Take a lease for `listener`.
    ///
    /// Resolves immediately when leases are already held; otherwise waits
    /// for the shared probe. A waiter dropped before the probe resolves is
    /// never counted.
    pub async fn acquire(&self, listener: ListenerId) -> Result<(), LeaseError> {
        let rx = {
            let mut state = self.inner.lock();
            if state.total() > 0 {
                state.grant(listener);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending.push((listener, tx));
            if !state.probing {
                state.probing = true;
                self.spawn_probe();
            }
            rx
        };
        rx.await.unwrap_or(Err(LeaseError::Abandoned))
    }

    /// Drop one lease held by `listener`.
    pub fn release(&self, listener: &ListenerId) -> Result<(), LeaseError> {
        let mut state = self.inner.lock();
        let Some(count) = state.active.get_mut(listener) else {
            return Err(LeaseError::NotHeld(listener.clone()));
        };
        *count -= 1;
        if *count == 0 {
            state.active.remove(listener);
        }
        if state.active.is_empty() {
            tracing::debug!(listener = %listener, "last lease released");
        }
        Ok(())
    }

    /// Total leases held across listeners.
    pub fn active_count(&self) -> usize {
        self.inner.lock().total()
    }

    pub fn count(&self, listener: &ListenerId) -> usize {
        self.inner.lock().active.get(listener).copied().unwrap_or(0)
    }

    pub fn probe_in_flight(&self) -> bool {
        self.inner.lock().probing
    }

    fn spawn_probe(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let timeout = inner.probe_timeout;
            let verdict = match tokio::time::timeout(timeout, inner.subsystem.is_running()).await
            {
                Ok(true) => Ok(()),
                Ok(false) => Err(LeaseError::Unavailable),
                Err(_) => Err(LeaseError::ProbeTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            tracing::debug!(running = verdict.is_ok(), "subsystem probe resolved");

            let mut state = inner.lock();
            state.probing = false;
            for (listener, tx) in std::mem::take(&mut state.pending) {
                // A waiter whose receiver is gone is not counted.
                if tx.send(verdict.clone()).is_ok() && verdict.is_ok() {
                    state.grant(listener);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct Probe {
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl Subsystem for Probe {
        async fn is_running(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.load(Ordering::SeqCst)
        }
    }

    fn counter(running: bool, delay_ms: u64) -> (ServiceRefCounter<Probe>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Probe {
            calls: calls.clone(),
            running: Arc::new(AtomicBool::new(running)),
            delay: Duration::from_millis(delay_ms),
        };
        (ServiceRefCounter::new(probe, Duration::from_secs(1)), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_probe() {
        let (leases, calls) = counter(true, 50);
        let results = acquire_all(&leases, 8).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leases.active_count(), 8);

        leases.acquire(ListenerId::from("late")).await.expect("fast path");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "held leases skip the probe");
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_subsystem_grants_nothing() {
        let (leases, _) = counter(false, 10);
        let err = leases.acquire(ListenerId::from("a")).await.unwrap_err();
        assert_eq!(err, LeaseError::Unavailable);
        assert_eq!(leases.active_count(), 0);
        assert!(!leases.probe_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let (leases, _) = counter(true, 5_000);
        let err = leases.acquire(ListenerId::from("a")).await.unwrap_err();
        assert_eq!(err, LeaseError::ProbeTimeout { timeout_ms: 1_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn release_balances_acquire() {
        let (leases, _) = counter(true, 1);
        let id = ListenerId::from("relay");
        leases.acquire(id.clone()).await.expect("first");
        leases.acquire(id.clone()).await.expect("second");
        assert_eq!(leases.count(&id), 2);
        leases.release(&id).expect("release");
        leases.release(&id).expect("release");
        assert_eq!(leases.active_count(), 0);
        assert_eq!(leases.release(&id), Err(LeaseError::NotHeld(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_is_not_counted() {
        let (leases, _) = counter(true, 100);
        let abandoned = {
            let leases = leases.clone();
            tokio::spawn(async move { leases.acquire(ListenerId::from("gone")).await })
        };
        tokio::task::yield_now().await;
        abandoned.abort();
        let _ = abandoned.await;

        leases.acquire(ListenerId::from("kept")).await.expect("acquire");
        assert_eq!(leases.count(&ListenerId::from("gone")), 0);
        assert_eq!(leases.active_count(), 1);
    }

    async fn acquire_all(
        leases: &ServiceRefCounter<Probe>,
        n: usize,
    ) -> Vec<Result<(), LeaseError>> {
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let leases = leases.clone();
                tokio::spawn(async move { leases.acquire(ListenerId(format!("l{i}"))).await })
            })
            .collect();
        let mut results = Vec::with_capacity(n);
        for handle in handles {
            results.push(handle.await.expect("join"));
        }
        results
    }
}
