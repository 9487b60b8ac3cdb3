use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::{config, LogFormat, TableName};
use tether_sync::{
    ListenerId, Pipeline, RelayError, ServiceRefCounter, SyncRun, SyncScope,
};

use crate::companion::CompanionLink;
use crate::error::{io_err, DaemonError};
use crate::paths::{log_path, logs_dir, relay_inbox, relay_rejected, socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

const RELAY_LISTENER: &str = "relay-watcher";
const LEASE_RETRY: Duration = Duration::from_secs(5);

struct SyncJob {
    scope: SyncScope,
    dry_run: bool,
    source: &'static str,
    respond_to: oneshot::Sender<Result<SyncSummary, String>>,
}

/// Outcome of one daemon-run sync, as reported over the socket.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub source: String,
    pub finished_at_unix: u64,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<SyncRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Relay watcher counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    ingested: AtomicUsize,
    rejected: AtomicUsize,
    purge_failed: AtomicUsize,
    staging_failed: AtomicUsize,
}

impl RelayStats {
    fn snapshot(&self) -> Value {
        json!({
            "ingested": self.ingested.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "purge_failed": self.purge_failed.load(Ordering::Relaxed),
            "staging_failed": self.staging_failed.load(Ordering::Relaxed),
        })
    }
}

/// State shared by the daemon's tasks.
pub struct DaemonContext {
    home: PathBuf,
    pipeline: Arc<Pipeline>,
    leases: ServiceRefCounter<CompanionLink>,
    relay: RelayStats,
    last_sync: RwLock<Option<SyncSummary>>,
    started_at_unix: u64,
}

impl DaemonContext {
    pub fn new(home: PathBuf, pipeline: Pipeline) -> Self {
        let leases = ServiceRefCounter::new(
            CompanionLink::new(relay_inbox(&home)),
            pipeline.config().probe_timeout(),
        );
        Self {
            home,
            pipeline: Arc::new(pipeline),
            leases,
            relay: RelayStats::default(),
            last_sync: RwLock::new(None),
            started_at_unix: unix_seconds_now(),
        }
    }
}

/// Load config, install tracing and run the daemon until stopped.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = config::load_at(home)?;
    ensure_runtime_dirs(home)?;
    init_tracing(home, config.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let pipeline = Pipeline::open(home, config)?;
    runtime.block_on(run(Arc::new(DaemonContext::new(home.to_path_buf(), pipeline))))
}

/// Run the daemon runtime.
pub async fn run(ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&ctx.home)?;
    tracing::info!(
        device = %ctx.pipeline.config().device,
        home = %ctx.home.display(),
        "daemon starting"
    );

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let cancel = CancellationToken::new();

    let relay_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = relay_watcher_task(ctx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(ctx, sync_rx, cancel, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(ctx, sync_tx, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = ctx.home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let result = tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        let _ = shutdown.send(());
                        Ok(())
                    }
                    Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                },
            };
            // Stop issuing batches; in-flight ones still commit.
            cancel.cancel();
            result
        })
    };

    let (relay_result, processor_result, socket_result, rotation_result, signal_result) = tokio::join!(
        relay_handle,
        processor_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("relay_watcher", relay_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Relay inbox
// ---------------------------------------------------------------------------

async fn relay_watcher_task(
    ctx: Arc<DaemonContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let inbox = relay_inbox(&ctx.home);
    if !inbox.exists() {
        fs::create_dir_all(&inbox).map_err(|e| io_err(&inbox, e))?;
    }

    let listener = ListenerId::from(RELAY_LISTENER);
    loop {
        match ctx.leases.acquire(listener.clone()).await {
            Ok(()) => break,
            Err(err) => {
                tracing::warn!(error = %err, "companion link unavailable; retrying");
                tokio::select! {
                    _ = shutdown_rx.recv() => return Ok(()),
                    _ = tokio::time::sleep(LEASE_RETRY) => continue,
                }
            }
        }
    }

    // Canonicalize so event paths (which arrive as real paths) match `starts_with`.
    let inbox = fs::canonicalize(&inbox).unwrap_or(inbox);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&inbox, RecursiveMode::NonRecursive)?;
    tracing::info!(inbox = %inbox.display(), "watching relay inbox");

    for path in pending_messages(&inbox)? {
        ingest_path(&ctx, &path).await;
    }

    let mut debounce = HashMap::<PathBuf, Instant>::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if !is_relay_message(&path, &inbox) {
                        continue;
                    }
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }
                    ingest_path(&ctx, &path).await;
                }
            }
        }
    }

    drop(watcher);
    if let Err(err) = ctx.leases.release(&listener) {
        tracing::warn!(error = %err, "companion lease release failed");
    }
    Ok(())
}

/// Stage one inbox file. Unroutable files move to the rejected directory;
/// files whose staging failed stay put and are retried on the next start.
async fn ingest_path(ctx: &DaemonContext, path: &Path) {
    // Our own purge raises events for paths that are already gone.
    if !path.exists() {
        return;
    }
    match ctx.pipeline.relay().ingest_file(path).await {
        Ok(outcome) => {
            ctx.relay.ingested.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                table = %outcome.table,
                row = %outcome.row,
                token = %outcome.token,
                "relay message staged"
            );
        }
        Err(err @ (RelayError::Routing { .. } | RelayError::Decode(_))) => {
            ctx.relay.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(path = %path.display(), error = %err, "relay message rejected");
            if let Err(err) = reject(&ctx.home, path) {
                tracing::warn!(error = %err, "could not move rejected relay message");
            }
        }
        Err(err @ RelayError::Purge { .. }) => {
            ctx.relay.purge_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(path = %path.display(), error = %err, "relay message staged but not purged");
        }
        Err(err) => {
            ctx.relay.staging_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(path = %path.display(), error = %err, "relay message not staged");
        }
    }
}

fn reject(home: &Path, path: &Path) -> Result<(), DaemonError> {
    let rejected = relay_rejected(home);
    fs::create_dir_all(&rejected).map_err(|e| io_err(&rejected, e))?;
    let target = rejected.join(path.file_name().unwrap_or_default());
    fs::rename(path, &target).map_err(|e| io_err(&target, e))
}

/// Messages already waiting in the inbox, oldest name first.
fn pending_messages(inbox: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(inbox).map_err(|e| io_err(inbox, e))? {
        let path = entry.map_err(|e| io_err(inbox, e))?.path();
        if is_relay_message(&path, inbox) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Producers write `<name>.json.tmp` and rename; only the final name counts.
fn is_relay_message(path: &Path, inbox: &Path) -> bool {
    path.parent() == Some(inbox)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Sync processor
// ---------------------------------------------------------------------------

async fn sync_processor_task(
    ctx: Arc<DaemonContext>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    cancel: CancellationToken,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let started = Instant::now();
                let result = ctx
                    .pipeline
                    .sync(&job.scope, job.dry_run, cancel.child_token())
                    .await;

                let summary = SyncSummary {
                    source: job.source.to_string(),
                    finished_at_unix: unix_seconds_now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ok: result.is_ok(),
                    error: result.as_ref().err().map(|e| e.to_string()),
                    run: result.ok(),
                };
                if !job.dry_run {
                    *ctx.last_sync.write().await = Some(summary.clone());
                }

                let outcome = match &summary.error {
                    None => Ok(summary),
                    Some(message) => Err(message.clone()),
                };
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(())
}

async fn enqueue_sync(
    sync_tx: &mpsc::Sender<SyncJob>,
    scope: SyncScope,
    dry_run: bool,
    source: &'static str,
) -> Result<SyncSummary, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            scope,
            dry_run,
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
    outcome.map_err(DaemonError::Protocol)
}

fn scope_for(tables: Vec<String>) -> SyncScope {
    if tables.is_empty() {
        SyncScope::All
    } else {
        SyncScope::Tables(tables.into_iter().map(TableName::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    ctx: Arc<DaemonContext>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "socket server listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let sync_tx = sync_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx, sync_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<DaemonContext>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&ctx).await),
            "sync" => {
                let scope = scope_for(request.tables);
                match enqueue_sync(&sync_tx, scope, request.dry_run, "socket").await {
                    Ok(summary) => DaemonResponse::ok(json!(summary)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(ctx: &DaemonContext) -> Value {
    let last_sync = ctx.last_sync.read().await.clone();
    let config = ctx.pipeline.config();
    json!({
        "running": true,
        "started_at_unix": ctx.started_at_unix,
        "device": config.device.0,
        "tables": config.tables,
        "session": ctx.pipeline.coordinator().state(),
        "last_sync": last_sync,
        "relay": ctx.relay.snapshot(),
        "companion_leases": ctx.leases.active_count(),
        "socket": socket_path(&ctx.home).display().to_string(),
        "inbox": relay_inbox(&ctx.home).display().to_string(),
    })
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; never rotate on startup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&home))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [logs_dir(home), relay_inbox(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Log to `~/.tether/logs/daemon.log`, reopened per event so rotation never
/// strands the writer on a renamed file.
fn init_tracing(home: &Path, format: LogFormat) {
    use std::fs::OpenOptions;
    use std::io::Write;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log = log_path(home);
    let writer = move || -> Box<dyn Write> {
        match OpenOptions::new().create(true).append(true).open(&log) {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(std::io::stderr()),
        }
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
}
