//! Upload sessions: drain uncommitted rows to the transport and mark them
//! committed once the server has them.
//!
//! # Session flow
//!
//! ```text
//! cutoff = now
//! for table in monitored tables (skipping ones without schema or formatter):
//!     for owner in configured owners ∪ owners in table:
//!         spawn pair task:
//!             loop:
//!                 rows = fetch(uncommitted ∧ ts ≤ cutoff ∧ owner, batch_size)
//!                 empty -> done
//!                 write(category, path, format(rows)) under timeout
//!                   ok   -> update(committed = true, same predicate ∧ id ∈ rows)
//!                   fail -> record error, stop this pair
//! close enumeration, await barrier
//! ```
//!
//! Pairs run concurrently, at most `max_in_flight` batches at once. Within a
//! pair, batches are strictly sequential.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use tether_core::{
    Category, Config, OwnerId, Record, Row, TableName, TableSchema, COMMITTED_FIELD, OWNER_FIELD,
};
use tether_store::{Conditions, RecordStore, StoreError};

use crate::barrier::CompletionBarrier;
use crate::error::{SyncError, TransportError};
use crate::format::{encode_batch, FormatterRegistry, RecordFormatter};
use crate::transport::{destination_path, Transport};

/// Knobs taken from [`Config`]. Destination paths use each table's own
/// device tag, not the configured device.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub owners: Vec<OwnerId>,
    pub tables: Vec<TableName>,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub write_timeout: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            owners: config.owners.clone(),
            tables: config.tables.clone(),
            batch_size: config.batch_size,
            max_in_flight: config.max_in_flight.max(1),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Which monitored tables a session drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "tables")]
pub enum SyncScope {
    #[default]
    All,
    Tables(Vec<TableName>),
}

impl SyncScope {
    fn includes(&self, table: &TableName) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Tables(tables) => tables.contains(table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running { cutoff: i64 },
    Resolved { cutoff: i64, success: bool },
    Cancelled { cutoff: i64 },
}

/// Summary of a session that finished without batch failures, or that was
/// cancelled (failed batches are then counted in `batches_failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub cutoff: i64,
    pub outcome: SessionOutcome,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub records_committed: usize,
    pub skipped_tables: Vec<TableName>,
    pub uploaded_paths: Vec<String>,
}

/// Rows a session would upload for one (table, owner) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub table: TableName,
    pub owner: OwnerId,
    pub records: usize,
    pub batches: usize,
}

/// Drives upload sessions. Sessions never overlap; a session whose future
/// is dropped releases the coordinator immediately.
pub struct UploadCoordinator {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    formatters: Arc<FormatterRegistry>,
    settings: SyncSettings,
    state: Mutex<SessionState>,
    seq: Arc<AtomicU64>,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        formatters: FormatterRegistry,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            transport,
            formatters: Arc::new(formatters),
            settings,
            state: Mutex::new(SessionState::Idle),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run a session with the cutoff taken now.
    pub async fn run_session(
        &self,
        scope: &SyncScope,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SyncError> {
        self.run_session_until(Utc::now().timestamp_millis(), scope, cancel)
            .await
    }

    /// Run a session that only considers rows with timestamp ≤ `cutoff` (epoch ms).
    pub async fn run_session_until(
        &self,
        cutoff: i64,
        scope: &SyncScope,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SyncError> {
        let running = {
            let mut state = self.lock_state();
            if matches!(*state, SessionState::Running { .. }) {
                return Err(SyncError::SessionInProgress);
            }
            *state = SessionState::Running { cutoff };
            RunningGuard {
                state: &self.state,
                cutoff,
                stop: cancel.child_token(),
                settled: false,
            }
        };
        tracing::info!(cutoff, "upload session started");

        let result = self.drive(cutoff, scope, &running.stop).await;

        let next = match &result {
            Ok(report) if report.outcome == SessionOutcome::Cancelled => {
                SessionState::Cancelled { cutoff }
            }
            Ok(_) => SessionState::Resolved {
                cutoff,
                success: true,
            },
            Err(_) => SessionState::Resolved {
                cutoff,
                success: false,
            },
        };
        running.settle(next);

        match &result {
            Ok(report) => tracing::info!(
                cutoff,
                outcome = ?report.outcome,
                batches = report.batches_committed,
                records = report.records_committed,
                "upload session finished"
            ),
            Err(e) => tracing::warn!(cutoff, error = %e, "upload session finished with failures"),
        }
        result
    }

    /// Count what a session with `cutoff` would upload, without uploading.
    pub async fn pending(
        &self,
        cutoff: i64,
        scope: &SyncScope,
    ) -> Result<Vec<PendingUpload>, SyncError> {
        let mut pending = Vec::new();
        for target in self.targets(scope).await?.targets {
            let conditions = target
                .formatter
                .restrict(eligible(&target.owner, &target.schema, cutoff));
            let store = self.store.clone();
            let table = target.schema.name.clone();
            let records = blocking(move || store.count(&table, &conditions)).await?;
            if records > 0 {
                pending.push(PendingUpload {
                    table: target.schema.name.clone(),
                    owner: target.owner,
                    records,
                    batches: records.div_ceil(self.settings.batch_size),
                });
            }
        }
        Ok(pending)
    }

    async fn drive(
        &self,
        cutoff: i64,
        scope: &SyncScope,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, SyncError> {
        let Targets { targets, skipped } = self.targets(scope).await?;

        let session = Arc::new(Session {
            store: self.store.clone(),
            transport: self.transport.clone(),
            barrier: CompletionBarrier::new(),
            permits: Semaphore::new(self.settings.max_in_flight),
            cancel: cancel.clone(),
            cutoff,
            batch_size: self.settings.batch_size,
            write_timeout: self.settings.write_timeout,
            seq: self.seq.clone(),
            uploaded: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        for target in targets {
            session.barrier.enter();
            let session = session.clone();
            tokio::spawn(async move {
                let _unit = UnitGuard(&session.barrier);
                session.drain(&target).await;
            });
        }
        session.barrier.close();

        let waited = session.barrier.wait().await;
        // Only a cancel that kept a batch from being issued makes the
        // session cancelled; failed batches then stay visible in the tally.
        let cancelled = session.stopped.load(Ordering::Acquire);
        let tally = match waited {
            Ok(tally) => tally,
            Err(SyncError::PartialCommit { .. }) if cancelled => session.barrier.tally(),
            Err(e) => return Err(e),
        };
        let uploaded_paths = std::mem::take(&mut *lock(&session.uploaded));
        Ok(SessionReport {
            cutoff,
            outcome: if cancelled {
                SessionOutcome::Cancelled
            } else {
                SessionOutcome::Completed
            },
            batches_committed: tally.committed,
            batches_failed: tally.failed,
            records_committed: tally.records,
            skipped_tables: skipped,
            uploaded_paths,
        })
    }

    /// Resolve every (table, owner) pair in scope.
    async fn targets(&self, scope: &SyncScope) -> Result<Targets, SyncError> {
        let mut targets = Vec::new();
        let mut skipped = Vec::new();

        for table in self.settings.tables.iter().filter(|t| scope.includes(t)) {
            let Some(schema) = self.store.schema(table) else {
                tracing::warn!(table = %table, "table not created in store; skipping");
                skipped.push(table.clone());
                continue;
            };
            let formatter = match self.formatters.get(table) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(table = %table, error = %e, "skipping table");
                    skipped.push(table.clone());
                    continue;
                }
            };

            let store = self.store.clone();
            let name = table.clone();
            let present = blocking(move || store.owners(&name)).await?;
            let owners: BTreeSet<OwnerId> = self
                .settings
                .owners
                .iter()
                .cloned()
                .chain(present)
                .collect();

            for owner in owners {
                targets.push(PairTarget {
                    schema: schema.clone(),
                    owner,
                    formatter: formatter.clone(),
                });
            }
        }
        Ok(Targets { targets, skipped })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }
}

// ---------------------------------------------------------------------------
// Per-session machinery
// ---------------------------------------------------------------------------

struct Targets {
    targets: Vec<PairTarget>,
    skipped: Vec<TableName>,
}

struct PairTarget {
    schema: Arc<TableSchema>,
    owner: OwnerId,
    formatter: Arc<dyn RecordFormatter>,
}

struct Session {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    barrier: CompletionBarrier,
    permits: Semaphore,
    cancel: CancellationToken,
    cutoff: i64,
    batch_size: usize,
    write_timeout: Duration,
    seq: Arc<AtomicU64>,
    uploaded: Mutex<Vec<String>>,
    /// Set when cancellation kept a pair from issuing its next batch.
    stopped: AtomicBool,
}

/// Holds a session's `Running` state. If the session future is dropped
/// before it settles, the pair tasks are told to stop and the session is
/// recorded as cancelled.
struct RunningGuard<'a> {
    state: &'a Mutex<SessionState>,
    cutoff: i64,
    stop: CancellationToken,
    settled: bool,
}

impl RunningGuard<'_> {
    fn settle(mut self, next: SessionState) {
        *lock(self.state) = next;
        self.settled = true;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.stop.cancel();
        *lock(self.state) = SessionState::Cancelled {
            cutoff: self.cutoff,
        };
        tracing::warn!(cutoff = self.cutoff, "upload session dropped before it finished");
    }
}

/// Settles a pair's barrier unit even if the pair task panics.
struct UnitGuard<'a>(&'a CompletionBarrier);

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

impl Session {
    /// Upload one pair's batches in order until none remain, a batch fails,
    /// or the session is cancelled.
    ///
    /// A cancelled pair still looks for its next batch, so that a pair with
    /// nothing left to send finishes normally instead of counting as stopped.
    async fn drain(&self, target: &PairTarget) {
        let table = &target.schema.name;
        loop {
            let _permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.permits.acquire() => match permit {
                    Ok(p) => Some(p),
                    Err(_) => break,
                },
            };

            let conditions = target
                .formatter
                .restrict(eligible(&target.owner, &target.schema, self.cutoff));
            let rows = {
                let store = self.store.clone();
                let name = table.clone();
                let fetch = conditions.clone();
                let limit = self.batch_size;
                blocking(move || Ok(store.fetch(&name, limit, &fetch)?.collect::<Vec<Row>>()))
                    .await
            };
            let rows = match rows {
                Ok(rows) if rows.is_empty() => break,
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(table = %table, owner = %target.owner, error = %e, "fetch failed");
                    self.barrier.enter();
                    self.barrier.leave_batch(Err(e));
                    break;
                }
            };
            if self.cancel.is_cancelled() {
                tracing::debug!(table = %table, owner = %target.owner, rows = rows.len(), "batch not issued; session cancelled");
                self.stopped.store(true, Ordering::Release);
                break;
            }

            self.barrier.enter();
            let result = self.upload(target, conditions, rows).await;
            let failed = result.is_err();
            self.barrier.leave_batch(result);
            if failed {
                break;
            }
        }
    }

    async fn upload(
        &self,
        target: &PairTarget,
        conditions: Conditions,
        rows: Vec<Row>,
    ) -> Result<usize, SyncError> {
        let schema = &target.schema;
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        let bytes = encode_batch(target.formatter.as_ref(), &rows);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = destination_path(&target.owner, &schema.device, &schema.name, now(), seq);
        let category: Category = schema.category;

        match tokio::time::timeout(
            self.write_timeout,
            self.transport.write(category, &path, bytes),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(table = %schema.name, owner = %target.owner, path = %path, error = %e, "batch upload failed");
                return Err(e.into());
            }
            Err(_) => {
                let timeout_ms = self.write_timeout.as_millis() as u64;
                tracing::warn!(table = %schema.name, owner = %target.owner, path = %path, timeout_ms, "batch upload timed out");
                return Err(TransportError::Timeout { path, timeout_ms }.into());
            }
        }

        let commit = conditions.ids(ids);
        let store = self.store.clone();
        let name = schema.name.clone();
        let committed = blocking(move || {
            store.update(&name, Record::new().with(COMMITTED_FIELD, true), &commit)
        })
        .await?;

        tracing::info!(
            table = %schema.name,
            owner = %target.owner,
            rows = committed,
            path = %path,
            "batch committed"
        );
        lock(&self.uploaded).push(path);
        Ok(committed)
    }
}

/// Rows a session may upload for `owner`.
fn eligible(owner: &OwnerId, schema: &TableSchema, cutoff: i64) -> Conditions {
    Conditions::new()
        .eq(COMMITTED_FIELD, false)
        .le(&schema.timestamp_field, cutoff)
        .eq(OWNER_FIELD, owner.0.as_str())
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
        .map_err(SyncError::from)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
