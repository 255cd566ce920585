//! # Starter Process Supervisor
//!
//! Launches the privileged `starter` helper that builds (sandbox) or enters
//! (container, exec) an isolated execution context, and reports each
//! process's termination exactly once through a oneshot channel.
//!
//! ## Helper Protocol
//!
//! ```text
//! starter <sandbox|container|exec> --config <state>/starters/<handle>.config.json
//!
//! stdout line 1:  {"status":"ready"}
//!             or  {"status":"error","message":"..."}
//! stdout/stderr:  process output (pumped into the CRI log and live subscribers)
//! ```
//!
//! EOF, an error message, malformed JSON, or no line within
//! [`STARTER_READY_TIMEOUT`] is a launch failure: the child is killed and
//! reaped and no handle is persisted.
//!
//! ## Handles and Reconciliation
//!
//! ```text
//!   launch ──▶ handle persisted ──▶ watcher (child.wait) ──▶ completion
//!                    │                                          │
//!                    │ service restart                          ▼
//!                    ▼                               manager commits state
//!              reconcile()                                      │
//!        alive ──▶ adopted watcher ──▶ Lost                     ▼
//!        dead  ──▶ Lost (immediately)                 release(handle)
//! ```
//!
//! A handle file stays on disk until the owning manager calls
//! [`Supervisor::release`], so a crash between process exit and the state
//! commit is still reconciled on the next start.
//!
//! ## Liveness
//!
//! A handle is alive when `kill(pid, 0)` succeeds, the process is not a
//! zombie, and its start time in `/proc/<pid>/stat` matches the recorded one.
//! The last check guards against PID reuse across restarts.

use crate::constants::{
    ADOPTED_POLL_INTERVAL, MAX_EXEC_OUTPUT, OUTPUT_CHANNEL_CAPACITY, STARTER_READY_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::runtime::{EntityRef, Mount, Signal, Termination};
use crate::state::RecordStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stdin of a running container, shared between attach sessions.
pub type SharedStdin = Arc<tokio::sync::Mutex<ChildStdin>>;

/// Receives the single termination event of a supervised process.
pub type Completion = oneshot::Receiver<Termination>;

// =============================================================================
// Handles and Launch Configuration
// =============================================================================

/// Persisted identity of a supervised starter process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarterHandle {
    /// Handle identity (file name under the starters directory).
    pub id: String,
    /// Sandbox or container the process serves.
    pub entity: EntityRef,
    /// Process ID.
    pub pid: i32,
    /// Start time in clock ticks since boot, when observable.
    pub start_ticks: Option<u64>,
    /// Launch time.
    pub started_at: DateTime<Utc>,
}

/// Starter invocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarterMode {
    /// Create the namespaces of a pod sandbox.
    Sandbox,
    /// Start a container process inside a sandbox.
    Container,
    /// Run an extra process inside a running container.
    Exec,
}

impl StarterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Container => "container",
            Self::Exec => "exec",
        }
    }
}

/// Namespace the starter creates (no path) or joins (path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// Namespace type: `net`, `ipc`, `uts`, `pid`, `mnt`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Namespace file to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl NamespaceSpec {
    pub fn create(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            path: None,
        }
    }

    pub fn join(kind: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.to_string(),
            path: Some(path.into()),
        }
    }
}

/// Document written to `--config` for the starter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Sandbox or container identity.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Image artifact to run from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    pub namespaces: Vec<NamespaceSpec>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub mounts: Vec<Mount>,
    pub tty: bool,
    pub stdin: bool,
    /// Key server used to verify image signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_server: Option<String>,
}

/// Request to launch a long-lived starter process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub entity: EntityRef,
    pub mode: StarterMode,
    pub config: LaunchConfig,
    /// CRI log file receiving the process output.
    pub log_path: Option<PathBuf>,
}

/// Outcome of a successful launch.
#[derive(Debug)]
pub struct Launched {
    pub handle: StarterHandle,
    pub completion: Completion,
}

/// Persisted handle recovered on startup with its completion channel.
#[derive(Debug)]
pub struct Recovered {
    pub handle: StarterHandle,
    pub completion: Completion,
}

/// Starter launch that has not been handed to a watcher yet.
///
/// Dropped while armed, it kills the spawned process and removes the config
/// file. The `Child` is still unreaped at that point, so the pid cannot have
/// been reused.
struct PendingLaunch {
    pid: Option<i32>,
    config_path: PathBuf,
    armed: bool,
}

impl PendingLaunch {
    fn new(config_path: PathBuf) -> Self {
        Self {
            pid: None,
            config_path,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pid) = self.pid.take() {
            debug!(pid, "killing abandoned starter");
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        let _ = std::fs::remove_file(&self.config_path);
    }
}

/// First line of the starter's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReadyMessage {
    Ready,
    Error { message: String },
}

// =============================================================================
// Output
// =============================================================================

/// Output stream of a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

/// Formats a line in the CRI log format.
pub fn cri_log_line(at: DateTime<Utc>, stream: LogStream, line: &str) -> String {
    format!(
        "{} {} F {}\n",
        at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        stream.as_str(),
        line
    )
}

// =============================================================================
// Exec Sessions
// =============================================================================

/// Streaming exec session inside a running container.
#[derive(Debug)]
pub struct ExecSession {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<BufReader<ChildStdout>>,
    pub stderr: Option<ChildStderr>,
    child: Child,
}

impl ExecSession {
    /// Waits for the exec process to finish.
    pub async fn wait(&mut self) -> Result<Termination> {
        // Close stdin so the process sees EOF.
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        Ok(Termination::from_status(status))
    }

    /// Kills the exec process and reaps it.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Process bookkeeping kept while the service runs.
#[derive(Default)]
struct LiveProcess {
    tasks: Vec<AbortHandle>,
    stdin: Option<SharedStdin>,
    output: Option<broadcast::Sender<OutputLine>>,
}

type LiveMap = Arc<Mutex<HashMap<String, LiveProcess>>>;

/// Launches and watches starter processes.
pub struct Supervisor {
    starter: PathBuf,
    handles: RecordStore,
    cancel: CancellationToken,
    live: LiveMap,
}

impl Supervisor {
    /// Creates a supervisor persisting handles under `starters_dir`.
    pub fn new(
        starter: impl Into<PathBuf>,
        starters_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            starter: starter.into(),
            handles: RecordStore::open(starters_dir)?,
            cancel,
            live: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Starter executable path.
    pub fn starter_path(&self) -> &Path {
        &self.starter
    }

    fn config_path(&self, handle_id: &str) -> PathBuf {
        self.handles.dir().join(format!("{handle_id}.config.json"))
    }

    /// Launches a starter and waits for it to report readiness.
    ///
    /// Returns once the process is confirmed started; its termination arrives
    /// later on [`Launched::completion`].
    pub async fn launch(&self, spec: LaunchSpec) -> Result<Launched> {
        let handle_id = uuid::Uuid::new_v4().simple().to_string();
        let entity = spec.entity.clone();
        let launch_failed = |reason: String| Error::StarterLaunchFailed {
            entity: entity.to_string(),
            reason,
        };

        let config_path = self.config_path(&handle_id);
        // Dropping this future anywhere before the hand-off below kills the
        // child and removes its config.
        let mut pending = PendingLaunch::new(config_path.clone());
        let config = serde_json::to_vec_pretty(&spec.config)?;
        tokio::fs::write(&config_path, config)
            .await
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        let (mut child, stdout) = self
            .spawn_ready(spec.mode, &config_path, spec.config.stdin, &mut pending)
            .await
            .map_err(|e| match e {
                Error::Cancelled(_) => e,
                other => launch_failed(other.to_string()),
            })?;

        let Some(pid) = child.id().map(|pid| pid as i32) else {
            return Err(launch_failed("starter exited before reporting its pid".to_string()));
        };
        let handle = StarterHandle {
            id: handle_id.clone(),
            entity: spec.entity.clone(),
            pid,
            start_ticks: read_start_ticks(pid),
            started_at: Utc::now(),
        };

        let log = match &spec.log_path {
            Some(path) => open_log(path).await,
            None => None,
        };

        // No await from here on: the handle is persisted and the child moves
        // into its watcher in one step.
        if let Err(e) = self.handles.save(&handle.id, &handle) {
            let _ = child.start_kill();
            return Err(e);
        }
        let mut live = match self.live.lock() {
            Ok(live) => live,
            Err(_) => {
                let _ = child.start_kill();
                let _ = self.handles.remove(&handle.id);
                return Err(Error::lock_poisoned());
            }
        };
        pending.disarm();

        let stdin = child.stdin.take().map(|s| Arc::new(tokio::sync::Mutex::new(s)));
        let stderr = child.stderr.take();
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);

        let stdout_pump =
            tokio::spawn(pump(stdout, LogStream::Stdout, log.clone(), output.clone()));
        let mut tasks = vec![stdout_pump.abort_handle()];
        if let Some(stderr) = stderr {
            tasks.push(
                tokio::spawn(pump(BufReader::new(stderr), LogStream::Stderr, log, output.clone()))
                    .abort_handle(),
            );
        }

        let (tx, completion) = oneshot::channel();
        {
            let watcher = {
                let live = Arc::clone(&self.live);
                let handle_id = handle.id.clone();
                let entity = handle.entity.clone();
                tokio::spawn(async move {
                    let termination = match child.wait().await {
                        Ok(status) => Termination::from_status(status),
                        Err(e) => {
                            warn!(%entity, error = %e, "failed to wait for starter");
                            Termination::Lost
                        }
                    };
                    debug!(%entity, ?termination, "starter exited");
                    if let Ok(mut live) = live.lock() {
                        live.remove(&handle_id);
                    }
                    let _ = tx.send(termination);
                })
            };
            tasks.push(watcher.abort_handle());
            live.insert(
                handle.id.clone(),
                LiveProcess {
                    tasks,
                    stdin,
                    output: Some(output),
                },
            );
        }
        drop(live);

        info!(
            entity = %handle.entity,
            pid = handle.pid,
            mode = spec.mode.as_str(),
            "starter ready"
        );
        Ok(Launched { handle, completion })
    }

    /// Spawns the starter and consumes its readiness line.
    ///
    /// Exec processes die with their session; long-lived starters outlive the
    /// service and are only killed through `pending` until handed off.
    async fn spawn_ready(
        &self,
        mode: StarterMode,
        config_path: &Path,
        stdin: bool,
        pending: &mut PendingLaunch,
    ) -> Result<(Child, BufReader<ChildStdout>)> {
        let mut cmd = Command::new(&self.starter);
        cmd.arg(mode.as_str())
            .arg("--config")
            .arg(config_path)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(mode == StarterMode::Exec)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Internal(format!(
                "failed to spawn {}: {e}",
                self.starter.display()
            ))
        })?;
        pending.pid = child.id().map(|pid| pid as i32);

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            pending.pid = None;
            return Err(Error::Internal("starter stdout not captured".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        let ready = tokio::select! {
            read = tokio::time::timeout(STARTER_READY_TIMEOUT, read_ready(&mut stdout)) => {
                read.unwrap_or_else(|_| Err(Error::Timeout {
                    operation: "starter readiness".to_string(),
                    duration: STARTER_READY_TIMEOUT,
                }))
            }
            _ = self.cancel.cancelled() => Err(Error::Cancelled("starter launch".to_string())),
        };

        match ready {
            Ok(()) => Ok((child, stdout)),
            Err(e) => {
                let _ = child.kill().await;
                pending.pid = None;
                Err(e)
            }
        }
    }

    /// Sends a signal to the process behind `handle`.
    ///
    /// A process that is already gone counts as success.
    pub fn signal(&self, handle: &StarterHandle, signal: Signal) -> Result<()> {
        if !is_alive(handle) {
            debug!(entity = %handle.entity, %signal, "process already gone");
            return Ok(());
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let ret = unsafe { libc::kill(handle.pid, signal.as_i32()) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::SignalFailed {
                    id: handle.entity.id().to_string(),
                    reason: err.to_string(),
                });
            }
        }
        debug!(entity = %handle.entity, pid = handle.pid, %signal, "signal sent");
        Ok(())
    }

    /// Starts an exec process in the context of `target`.
    pub async fn exec(&self, target: &StarterHandle, config: LaunchConfig) -> Result<ExecSession> {
        if !is_alive(target) {
            return Err(Error::ExecFailed {
                container: target.entity.id().to_string(),
                reason: "container process is not running".to_string(),
            });
        }

        let config_path = self.config_path(&uuid::Uuid::new_v4().simple().to_string());
        let stdin = config.stdin;
        let mut pending = PendingLaunch::new(config_path.clone());
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)
            .await
            .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        let started = self
            .spawn_ready(StarterMode::Exec, &config_path, stdin, &mut pending)
            .await;
        // The session owns the child from here; dropping `pending` only
        // removes the config.
        pending.pid = None;
        drop(pending);
        let (mut child, stdout) = started.map_err(|e| match e {
            Error::Cancelled(_) => e,
            other => Error::ExecFailed {
                container: target.entity.id().to_string(),
                reason: other.to_string(),
            },
        })?;

        Ok(ExecSession {
            stdin: child.stdin.take(),
            stdout: Some(stdout),
            stderr: child.stderr.take(),
            child,
        })
    }

    /// Runs an exec process to completion and captures its output.
    ///
    /// Output beyond [`MAX_EXEC_OUTPUT`] per stream is discarded. On timeout
    /// the process is killed.
    pub async fn exec_sync(
        &self,
        target: &StarterHandle,
        config: LaunchConfig,
        timeout: Option<Duration>,
    ) -> Result<crate::runtime::ExecResult> {
        let mut session = self.exec(target, config).await?;
        let Some(limit) = timeout else {
            return collect(&mut session).await;
        };
        match tokio::time::timeout(limit, collect(&mut session)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                session.kill().await;
                Err(Error::Timeout {
                    operation: format!("exec in {}", target.entity),
                    duration: limit,
                })
            }
        }
    }

    /// Stdin of a launched process, when it was started with stdin.
    pub fn stdin(&self, handle_id: &str) -> Option<SharedStdin> {
        let live = self.live.lock().ok()?;
        live.get(handle_id).and_then(|p| p.stdin.clone())
    }

    /// Subscribes to the live output of a launched process.
    pub fn subscribe(&self, handle_id: &str) -> Option<broadcast::Receiver<OutputLine>> {
        let live = self.live.lock().ok()?;
        live.get(handle_id)
            .and_then(|p| p.output.as_ref())
            .map(|tx| tx.subscribe())
    }

    /// Inspects handles persisted by a previous run.
    ///
    /// Live processes are adopted and watched; dead ones get an immediate
    /// [`Termination::Lost`] completion.
    pub fn reconcile(&self) -> Result<Vec<Recovered>> {
        let handles: Vec<StarterHandle> = self.handles.load_all()?;
        let mut recovered = Vec::with_capacity(handles.len());

        for handle in handles {
            let (tx, completion) = oneshot::channel();
            if is_alive(&handle) {
                info!(entity = %handle.entity, pid = handle.pid, "adopting running starter");
                let mut live = self.live.lock().map_err(|_| Error::lock_poisoned())?;
                let watcher =
                    tokio::spawn(watch_adopted(handle.clone(), Arc::clone(&self.live), tx));
                live.insert(
                    handle.id.clone(),
                    LiveProcess {
                        tasks: vec![watcher.abort_handle()],
                        ..LiveProcess::default()
                    },
                );
            } else {
                info!(
                    entity = %handle.entity,
                    pid = handle.pid,
                    "starter vanished while service was down"
                );
                let _ = tx.send(Termination::Lost);
            }
            recovered.push(Recovered { handle, completion });
        }

        Ok(recovered)
    }

    /// Forgets a handle whose completion has been committed.
    pub fn release(&self, handle: &StarterHandle) -> Result<()> {
        if let Ok(mut live) = self.live.lock()
            && let Some(process) = live.remove(&handle.id)
        {
            for task in process.tasks {
                task.abort();
            }
        }
        self.handles.remove(&handle.id)?;
        let _ = std::fs::remove_file(self.config_path(&handle.id));
        debug!(entity = %handle.entity, "starter handle released");
        Ok(())
    }

    /// Stops watching every process without touching the processes.
    ///
    /// Handles stay on disk for the next start to adopt.
    pub fn detach(&self) {
        if let Ok(mut live) = self.live.lock() {
            for (_, process) in live.drain() {
                for task in process.tasks {
                    task.abort();
                }
            }
        }
    }
}

async fn read_ready(stdout: &mut BufReader<ChildStdout>) -> Result<()> {
    let mut line = String::new();
    if stdout.read_line(&mut line).await? == 0 {
        return Err(Error::Internal(
            "starter exited without reporting readiness".to_string(),
        ));
    }
    let message: ReadyMessage = serde_json::from_str(line.trim())
        .map_err(|e| Error::Internal(format!("malformed readiness message: {e}")))?;
    match message {
        ReadyMessage::Ready => Ok(()),
        ReadyMessage::Error { message } => Err(Error::Internal(message)),
    }
}

async fn collect(session: &mut ExecSession) -> Result<crate::runtime::ExecResult> {
    let stdout = session.stdout.take();
    let stderr = session.stderr.take();
    let (stdout, stderr) = tokio::join!(read_capped(stdout), read_capped(stderr));
    let termination = session.wait().await?;
    Ok(crate::runtime::ExecResult {
        exit_code: termination.exit_code().unwrap_or(-1),
        stdout: stdout?,
        stderr: stderr?,
    })
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        (&mut reader)
            .take(MAX_EXEC_OUTPUT as u64)
            .read_to_end(&mut buf)
            .await?;
        // Drain the rest so the writer never blocks on a full pipe.
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok(buf)
}

async fn open_log(path: &Path) -> Option<Arc<tokio::sync::Mutex<tokio::fs::File>>> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(Arc::new(tokio::sync::Mutex::new(file))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open container log");
            None
        }
    }
}

async fn pump<R: AsyncBufRead + Unpin>(
    reader: R,
    stream: LogStream,
    log: Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    output: broadcast::Sender<OutputLine>,
) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(log) = &log {
            let entry = cri_log_line(Utc::now(), stream, &line);
            let mut file = log.lock().await;
            if let Err(e) = file.write_all(entry.as_bytes()).await {
                warn!(error = %e, "container log write failed");
            }
        }
        // No subscribers is fine.
        let _ = output.send(OutputLine { stream, line });
    }
}

async fn watch_adopted(handle: StarterHandle, live: LiveMap, tx: oneshot::Sender<Termination>) {
    wait_for_exit(&handle).await;
    info!(entity = %handle.entity, pid = handle.pid, "adopted starter exited");
    if let Ok(mut live) = live.lock() {
        live.remove(&handle.id);
    }
    let _ = tx.send(Termination::Lost);
}

/// Waits until a process that is not our child terminates.
#[cfg(target_os = "linux")]
async fn wait_for_exit(handle: &StarterHandle) {
    let Some(fd) = pidfd_open(handle.pid) else {
        return poll_until_dead(handle).await;
    };
    match tokio::io::unix::AsyncFd::new(fd) {
        // Readable once the process has terminated.
        Ok(fd) => {
            let _ = fd.readable().await;
        }
        Err(_) => poll_until_dead(handle).await,
    }
}

#[cfg(not(target_os = "linux"))]
async fn wait_for_exit(handle: &StarterHandle) {
    poll_until_dead(handle).await;
}

async fn poll_until_dead(handle: &StarterHandle) {
    while is_alive(handle) {
        tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
    }
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: i32) -> Option<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;
    // SAFETY: pidfd_open takes plain integers and returns a new descriptor.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: the descriptor was just returned by the kernel and is owned here.
    Some(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd as i32) })
}

// =============================================================================
// Liveness
// =============================================================================

/// Fields of `/proc/<pid>/stat` used for liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    start_ticks: u64,
}

fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    // The command name is parenthesised and may contain spaces.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_ticks })
}

fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&content)
}

fn read_start_ticks(pid: i32) -> Option<u64> {
    read_proc_stat(pid).map(|stat| stat.start_ticks)
}

/// Returns true while the process behind `handle` is running.
pub fn is_alive(handle: &StarterHandle) -> bool {
    if handle.pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let ret = unsafe { libc::kill(handle.pid, 0) };
    if ret != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    match read_proc_stat(handle.pid) {
        Some(stat) => {
            stat.state != 'Z'
                && stat.state != 'X'
                && handle.start_ticks.is_none_or(|ticks| ticks == stat.start_ticks)
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let line = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 \
                    98765 1000 10";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.start_ticks, 98765);
        assert!(parse_proc_stat("garbage").is_none());
    }

    #[test]
    fn test_cri_log_line_format() {
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            cri_log_line(at, LogStream::Stderr, "boom"),
            "2024-01-02T03:04:05.123456789Z stderr F boom\n"
        );
    }

    #[test]
    fn test_ready_message_parsing() {
        let ok: ReadyMessage = serde_json::from_str(r#"{"status":"ready"}"#).unwrap();
        assert!(matches!(ok, ReadyMessage::Ready));
        let err: ReadyMessage =
            serde_json::from_str(r#"{"status":"error","message":"no ns"}"#).unwrap();
        assert!(matches!(err, ReadyMessage::Error { message } if message == "no ns"));
    }

    #[test]
    fn test_own_process_is_alive() {
        let pid = std::process::id() as i32;
        let handle = StarterHandle {
            id: "self".to_string(),
            entity: EntityRef::Sandbox("s".to_string()),
            pid,
            start_ticks: read_start_ticks(pid),
            started_at: Utc::now(),
        };
        assert!(is_alive(&handle));

        let reused = StarterHandle {
            start_ticks: handle.start_ticks.map(|t| t + 1),
            ..handle.clone()
        };
        if handle.start_ticks.is_some() {
            assert!(!is_alive(&reused), "start time mismatch means pid reuse");
        }
    }

    #[test]
    fn test_launch_config_shape() {
        let config = LaunchConfig {
            id: "c1".to_string(),
            namespaces: vec![
                NamespaceSpec::create("pid"),
                NamespaceSpec::join("net", "/proc/42/ns/net"),
            ],
            ..LaunchConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["namespaces"][0], serde_json::json!({"type": "pid"}));
        assert_eq!(json["namespaces"][1]["path"], "/proc/42/ns/net");
        assert!(json.get("image").is_none());
    }
}
