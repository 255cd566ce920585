//! Container manager.

use super::state::{
    ContainerConfig, ContainerFilter, ContainerRecord, ContainerState, ContainerStatus,
    REASON_STOPPED,
};
use crate::constants::{KILL_GRACE, MAX_CONTAINERS, validate_metadata_name};
use crate::error::{Error, Result};
use crate::image::{ImageService, ImageUsage};
use crate::pod::SandboxManager;
use crate::runtime::{EntityRef, ExecOptions, ExecResult, Signal, Termination};
use crate::starter::{
    Completion, ExecSession, LaunchConfig, LaunchSpec, NamespaceSpec, OutputLine, SharedStdin,
    StarterHandle, StarterMode, Supervisor,
};
use crate::state::RecordStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

struct ContainerEntry {
    op: tokio::sync::Mutex<()>,
    record: Mutex<ContainerRecord>,
    state: watch::Sender<ContainerState>,
}

impl ContainerEntry {
    fn new(record: ContainerRecord) -> Self {
        let (state, _) = watch::channel(record.state);
        Self {
            op: tokio::sync::Mutex::new(()),
            record: Mutex::new(record),
            state,
        }
    }

    fn snapshot(&self) -> Result<ContainerRecord> {
        Ok(self.record.lock().map_err(|_| Error::lock_poisoned())?.clone())
    }
}

/// Live streams of a running container.
#[derive(Debug)]
pub struct Attachment {
    /// Output lines produced after the attach.
    pub output: broadcast::Receiver<OutputLine>,
    /// Container stdin, when it was created with `stdin`.
    pub stdin: Option<SharedStdin>,
}

/// Owns container lifecycle within sandboxes.
pub struct ContainerManager {
    supervisor: Arc<Supervisor>,
    sandboxes: Arc<SandboxManager>,
    images: Arc<ImageService>,
    store: RecordStore,
    keys_server: Option<String>,
    containers: RwLock<HashMap<String, Arc<ContainerEntry>>>,
}

impl ContainerManager {
    /// Loads persisted container records.
    pub fn load(
        supervisor: Arc<Supervisor>,
        sandboxes: Arc<SandboxManager>,
        images: Arc<ImageService>,
        store: RecordStore,
        keys_server: Option<String>,
    ) -> Result<Self> {
        let records: Vec<ContainerRecord> = store.load_all()?;
        let containers: HashMap<_, _> = records
            .into_iter()
            .map(|record| (record.id.clone(), Arc::new(ContainerEntry::new(record))))
            .collect();
        info!(count = containers.len(), "container records loaded");

        Ok(Self {
            supervisor,
            sandboxes,
            images,
            store,
            keys_server,
            containers: RwLock::new(containers),
        })
    }

    fn entry(&self, id: &str) -> Result<Arc<ContainerEntry>> {
        let containers = self.containers.read().map_err(|_| Error::lock_poisoned())?;
        containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    fn entries(&self) -> Result<Vec<Arc<ContainerEntry>>> {
        let containers = self.containers.read().map_err(|_| Error::lock_poisoned())?;
        Ok(containers.values().cloned().collect())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a container bound to a `READY` sandbox and a stored image.
    pub fn create(&self, sandbox_id: &str, config: ContainerConfig) -> Result<String> {
        validate_metadata_name(&config.metadata.name)
            .map_err(|reason| Error::InvalidArgument(format!("metadata.name: {reason}")))?;
        if config.image.is_empty() {
            return Err(Error::InvalidArgument("image cannot be empty".to_string()));
        }

        // Lock order: image index, sandbox record, container map.
        let id = self.images.with_record(&config.image, |image| {
            self.sandboxes.with_ready(sandbox_id, |sandbox| {
                let mut containers =
                    self.containers.write().map_err(|_| Error::lock_poisoned())?;
                if containers.len() >= MAX_CONTAINERS {
                    return Err(Error::ResourceExhausted(format!(
                        "maximum number of containers ({MAX_CONTAINERS}) reached"
                    )));
                }
                for existing in containers.values() {
                    let record = existing.record.lock().map_err(|_| Error::lock_poisoned())?;
                    if record.sandbox_id == sandbox_id
                        && record.config.metadata == config.metadata
                    {
                        return Err(Error::ContainerAlreadyExists(format!(
                            "{} (attempt {}) in sandbox {sandbox_id} as {}",
                            config.metadata.name, config.metadata.attempt, record.id
                        )));
                    }
                }

                let id = loop {
                    let id = uuid::Uuid::new_v4().simple().to_string();
                    if !containers.contains_key(&id) {
                        break id;
                    }
                };
                let log_path = config.log_path.as_ref().map(|path| {
                    match &sandbox.config.log_directory {
                        Some(dir) if path.is_relative() => dir.join(path),
                        _ => path.clone(),
                    }
                });
                let record = ContainerRecord {
                    id: id.clone(),
                    sandbox_id: sandbox_id.to_string(),
                    config: config.clone(),
                    state: ContainerState::Created,
                    image_id: image.id.clone(),
                    image_path: image.path.clone(),
                    log_path,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    exit_code: None,
                    reason: None,
                    message: None,
                    handle: None,
                };
                self.store.save(&id, &record)?;
                containers.insert(id.clone(), Arc::new(ContainerEntry::new(record)));
                Ok(id)
            })
        })?;

        info!(container = %id, sandbox = %sandbox_id, image = %config.image, "container created");
        Ok(id)
    }

    /// Launches a `CREATED` container.
    ///
    /// Returns once the starter confirms the process started. A failed launch
    /// leaves the container `EXITED` with reason `StartError`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;

        let record = entry.snapshot()?;
        if record.state != ContainerState::Created {
            return Err(Error::InvalidState {
                entity: "container",
                id: id.to_string(),
                state: record.state.to_string(),
                expected: ContainerState::Created.to_string(),
            });
        }
        let namespace = self
            .sandboxes
            .with_ready(&record.sandbox_id, |sandbox| Ok(sandbox.namespace.clone()))?
            .ok_or_else(|| {
                Error::Internal(format!("sandbox {} has no namespace context", record.sandbox_id))
            })?;

        let config = &record.config;
        let mut namespaces = vec![
            NamespaceSpec::join("net", &namespace.net),
            NamespaceSpec::join("ipc", &namespace.ipc),
            NamespaceSpec::join("uts", &namespace.uts),
        ];
        namespaces.extend(["pid", "mnt"].into_iter().map(NamespaceSpec::create));

        let spec = LaunchSpec {
            entity: EntityRef::Container(id.to_string()),
            mode: StarterMode::Container,
            config: LaunchConfig {
                id: id.to_string(),
                image: Some(record.image_path.clone()),
                namespaces,
                args: config.command.iter().chain(&config.args).cloned().collect(),
                env: config.env.clone(),
                cwd: config.working_dir.clone(),
                mounts: config.mounts.clone(),
                tty: config.tty,
                stdin: config.stdin,
                keys_server: self.keys_server.clone(),
                ..LaunchConfig::default()
            },
            log_path: record.log_path.clone(),
        };

        let launched = match self.supervisor.launch(spec).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!(container = %id, error = %e, "container start failed");
                self.commit(&entry, |record| {
                    record.apply_start_error(e.to_string());
                    true
                })?;
                return Err(e);
            }
        };

        let handle = launched.handle.clone();
        let committed = self.commit(&entry, |record| {
            record.state = ContainerState::Running;
            record.started_at = Some(handle.started_at);
            record.handle = Some(handle.clone());
            true
        });
        if let Err(e) = committed {
            let _ = self.supervisor.signal(&launched.handle, Signal::Kill);
            let _ = self.supervisor.release(&launched.handle);
            return Err(e);
        }
        self.watch(Arc::clone(&entry), launched.handle.clone(), launched.completion);

        info!(container = %id, pid = launched.handle.pid, "container running");
        Ok(())
    }

    /// Applies `f` to the record, persists it and broadcasts the new state.
    fn commit(
        &self,
        entry: &ContainerEntry,
        f: impl FnOnce(&mut ContainerRecord) -> bool,
    ) -> Result<()> {
        commit(entry, &self.store, f)
    }

    fn watch(&self, entry: Arc<ContainerEntry>, handle: StarterHandle, completion: Completion) {
        let store = self.store.clone();
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            // A closed channel means the watcher was detached on shutdown.
            let Ok(termination) = completion.await else {
                return;
            };
            let id = handle.entity.id().to_string();
            match commit(&entry, &store, |record| record.apply_termination(termination)) {
                Ok(()) => info!(container = %id, ?termination, "container finished"),
                Err(e) => {
                    warn!(container = %id, error = %e, "failed to commit container exit");
                    return;
                }
            }
            if let Err(e) = supervisor.release(&handle) {
                warn!(container = %id, error = %e, "failed to release starter handle");
            }
        });
    }

    /// Stops a container: SIGTERM, up to `timeout`, then SIGKILL.
    ///
    /// Idempotent on `EXITED` and `UNKNOWN` containers. A `CREATED` container
    /// becomes `EXITED` without launching.
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;

        let record = entry.snapshot()?;
        match record.state {
            ContainerState::Exited | ContainerState::Unknown => {
                debug!(container = %id, state = %record.state, "container already stopped");
                return Ok(());
            }
            ContainerState::Created => {
                self.commit(&entry, |record| {
                    record.state = ContainerState::Exited;
                    record.finished_at = Some(Utc::now());
                    record.reason = Some(REASON_STOPPED.to_string());
                    true
                })?;
                info!(container = %id, "created container stopped");
                return Ok(());
            }
            ContainerState::Running => {}
        }

        let Some(handle) = record.handle else {
            self.commit(&entry, |record| record.apply_termination(Termination::Lost))?;
            return Ok(());
        };

        let mut state = entry.state.subscribe();
        let stopped = |s: &ContainerState| s.is_terminal();

        let graceful = if timeout.is_zero() {
            false
        } else {
            self.supervisor.signal(&handle, Signal::Term)?;
            tokio::time::timeout(timeout, state.wait_for(stopped)).await.is_ok()
        };
        if !graceful {
            debug!(container = %id, "escalating to SIGKILL");
            self.supervisor.signal(&handle, Signal::Kill)?;
            if tokio::time::timeout(KILL_GRACE, state.wait_for(stopped))
                .await
                .is_err()
            {
                return Err(Error::Internal(format!(
                    "container {id} did not exit after SIGKILL"
                )));
            }
        }

        info!(container = %id, "container stopped");
        Ok(())
    }

    /// Removes a container that is not `RUNNING`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;

        {
            let record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            if record.state == ContainerState::Running {
                return Err(Error::InvalidState {
                    entity: "container",
                    id: id.to_string(),
                    state: record.state.to_string(),
                    expected: "not RUNNING".to_string(),
                });
            }
            self.store.remove(id)?;
        }
        {
            let mut containers = self.containers.write().map_err(|_| Error::lock_poisoned())?;
            containers.remove(id);
        }

        info!(container = %id, "container removed");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self, id: &str) -> Result<ContainerStatus> {
        Ok(self.entry(id)?.snapshot()?.status())
    }

    pub fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerStatus>> {
        let mut statuses = Vec::new();
        for entry in self.entries()? {
            let record = entry.snapshot()?;
            if filter.matches(&record) {
                statuses.push(record.status());
            }
        }
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(statuses)
    }

    /// Identities of the containers bound to a sandbox.
    pub fn ids_in_sandbox(&self, sandbox_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.entries()? {
            let record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            if record.sandbox_id == sandbox_id {
                ids.push(record.id.clone());
            }
        }
        Ok(ids)
    }

    /// Number of containers bound to a sandbox.
    pub fn count_in_sandbox(&self, sandbox_id: &str) -> Result<usize> {
        Ok(self.ids_in_sandbox(sandbox_id)?.len())
    }

    // =========================================================================
    // Exec and Attach
    // =========================================================================

    fn running_handle(&self, id: &str) -> Result<(ContainerRecord, StarterHandle)> {
        let record = self.entry(id)?.snapshot()?;
        if record.state == ContainerState::Running
            && let Some(handle) = record.handle.clone()
        {
            return Ok((record, handle));
        }
        Err(Error::InvalidState {
            entity: "container",
            id: id.to_string(),
            state: record.state.to_string(),
            expected: ContainerState::Running.to_string(),
        })
    }

    fn exec_config(
        record: &ContainerRecord,
        handle: &StarterHandle,
        cmd: &[String],
        opts: &ExecOptions,
    ) -> LaunchConfig {
        let ns = PathBuf::from(format!("/proc/{}/ns", handle.pid));
        let mut env = record.config.env.clone();
        env.extend(opts.env.clone());
        LaunchConfig {
            id: record.id.clone(),
            image: Some(record.image_path.clone()),
            namespaces: ["mnt", "pid", "net", "ipc", "uts"]
                .into_iter()
                .map(|kind| NamespaceSpec::join(kind, ns.join(kind)))
                .collect(),
            args: cmd.to_vec(),
            env,
            cwd: opts
                .working_dir
                .clone()
                .or_else(|| record.config.working_dir.clone()),
            tty: opts.tty,
            stdin: opts.stdin,
            ..LaunchConfig::default()
        }
    }

    /// Runs a command in a `RUNNING` container and captures its output.
    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        if cmd.is_empty() {
            return Err(Error::InvalidArgument("exec command cannot be empty".to_string()));
        }
        let (record, handle) = self.running_handle(id)?;
        let config = Self::exec_config(&record, &handle, cmd, &ExecOptions::default());
        debug!(container = %id, ?cmd, "exec sync");
        self.supervisor.exec_sync(&handle, config, timeout).await
    }

    /// Starts a streaming exec session in a `RUNNING` container.
    pub async fn exec(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<ExecSession> {
        if cmd.is_empty() {
            return Err(Error::InvalidArgument("exec command cannot be empty".to_string()));
        }
        let (record, handle) = self.running_handle(id)?;
        let config = Self::exec_config(&record, &handle, cmd, &opts);
        self.supervisor.exec(&handle, config).await
    }

    /// Attaches to the output and stdin of a `RUNNING` container.
    pub fn attach(&self, id: &str) -> Result<Attachment> {
        let (_, handle) = self.running_handle(id)?;
        let output = self
            .supervisor
            .subscribe(&handle.id)
            .ok_or_else(|| Error::StreamUnavailable(id.to_string()))?;
        Ok(Attachment {
            output,
            stdin: self.supervisor.stdin(&handle.id),
        })
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Attaches a starter recovered on startup to its container.
    ///
    /// Returns false when no live container owns the handle.
    pub fn adopt(&self, handle: StarterHandle, completion: Completion) -> Result<bool> {
        let Ok(entry) = self.entry(handle.entity.id()) else {
            return Ok(false);
        };
        if entry.snapshot()?.state.is_terminal() {
            return Ok(false);
        }
        self.commit(&entry, |record| {
            if record.state == ContainerState::Created {
                // Crashed between readiness and the RUNNING commit.
                record.state = ContainerState::Running;
                record.started_at = Some(handle.started_at);
            }
            record.handle = Some(handle.clone());
            true
        })?;
        self.watch(entry, handle, completion);
        Ok(true)
    }

    /// Marks every `RUNNING` container that was not adopted as `UNKNOWN`.
    ///
    /// A process still running behind a stale record handle is killed first.
    pub fn finish_recovery(&self, adopted: &HashSet<String>) -> Result<()> {
        for entry in self.entries()? {
            let record = entry.snapshot()?;
            if record.state != ContainerState::Running || adopted.contains(&record.id) {
                continue;
            }
            warn!(container = %record.id, "container starter not recovered");
            if let Some(stale) = &record.handle
                && let Err(e) = self.supervisor.signal(stale, Signal::Kill)
            {
                warn!(container = %record.id, error = %e, "failed to kill unrecovered starter");
            }
            self.commit(&entry, |record| record.apply_termination(Termination::Lost))?;
        }
        Ok(())
    }
}

impl ImageUsage for ContainerManager {
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for entry in self.entries()? {
            let record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            if record.image_id == image_id {
                users.push(record.id.clone());
            }
        }
        users.sort();
        Ok(users)
    }
}

fn commit(
    entry: &ContainerEntry,
    store: &RecordStore,
    f: impl FnOnce(&mut ContainerRecord) -> bool,
) -> Result<()> {
    let state = {
        let mut record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
        let mut updated = record.clone();
        if !f(&mut updated) {
            return Ok(());
        }
        store.save(&updated.id, &updated)?;
        *record = updated;
        record.state
    };
    entry.state.send_replace(state);
    Ok(())
}
