//! Pod sandbox manager.
//!
//! Each sandbox entry carries its own locks:
//!
//! | Lock | Kind | Held |
//! |------|------|------|
//! | `op` | `tokio::sync::Mutex` | for a whole run/stop/remove operation |
//! | `record` | `std::sync::Mutex` | for short reads and commits, never across `.await` |
//!
//! State changes are broadcast on a `watch` channel so a stop can wait for the
//! completion event without holding the record.

use super::state::{
    NamespaceContext, SandboxConfig, SandboxFilter, SandboxRecord, SandboxState, SandboxStatus,
};
use crate::constants::{KILL_GRACE, MAX_SANDBOXES, SANDBOX_STOP_TIMEOUT, validate_metadata_name};
use crate::error::{Error, Result};
use crate::runtime::{EntityRef, Signal, Termination};
use crate::starter::{
    Completion, LaunchConfig, LaunchSpec, NamespaceSpec, StarterHandle, StarterMode, Supervisor,
};
use crate::state::RecordStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) struct SandboxEntry {
    op: tokio::sync::Mutex<()>,
    record: Mutex<SandboxRecord>,
    state: watch::Sender<SandboxState>,
}

impl SandboxEntry {
    fn new(record: SandboxRecord) -> Self {
        let (state, _) = watch::channel(record.state);
        Self {
            op: tokio::sync::Mutex::new(()),
            record: Mutex::new(record),
            state,
        }
    }

    fn snapshot(&self) -> Result<SandboxRecord> {
        Ok(self.record.lock().map_err(|_| Error::lock_poisoned())?.clone())
    }
}

/// Owns pod sandbox lifecycle.
pub struct SandboxManager {
    supervisor: Arc<Supervisor>,
    store: RecordStore,
    keys_server: Option<String>,
    sandboxes: RwLock<HashMap<String, Arc<SandboxEntry>>>,
    /// Identities that were removed and must not be handed out again.
    retired: Mutex<HashSet<String>>,
}

impl SandboxManager {
    /// Loads persisted sandbox records.
    pub fn load(
        supervisor: Arc<Supervisor>,
        store: RecordStore,
        keys_server: Option<String>,
    ) -> Result<Self> {
        let records: Vec<SandboxRecord> = store.load_all()?;
        let mut sandboxes = HashMap::with_capacity(records.len());
        for record in records {
            debug!(sandbox = %record.id, state = %record.state, "loaded sandbox record");
            sandboxes.insert(record.id.clone(), Arc::new(SandboxEntry::new(record)));
        }
        info!(count = sandboxes.len(), "sandbox records loaded");

        Ok(Self {
            supervisor,
            store,
            keys_server,
            sandboxes: RwLock::new(sandboxes),
            retired: Mutex::new(HashSet::new()),
        })
    }

    fn entry(&self, id: &str) -> Result<Arc<SandboxEntry>> {
        let sandboxes = self.sandboxes.read().map_err(|_| Error::lock_poisoned())?;
        sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))
    }

    fn allocate_id(&self, sandboxes: &HashMap<String, Arc<SandboxEntry>>) -> Result<String> {
        let retired = self.retired.lock().map_err(|_| Error::lock_poisoned())?;
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string();
            if !sandboxes.contains_key(&id) && !retired.contains(&id) {
                return Ok(id);
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a sandbox and starts its namespace context.
    ///
    /// On failure no record remains.
    pub async fn run(&self, config: SandboxConfig) -> Result<String> {
        for (field, value) in [
            ("metadata.name", &config.metadata.name),
            ("metadata.namespace", &config.metadata.namespace),
        ] {
            validate_metadata_name(value)
                .map_err(|reason| Error::InvalidArgument(format!("{field}: {reason}")))?;
        }

        let entry = Arc::new(SandboxEntry::new(SandboxRecord::new(String::new(), config.clone())));
        // Held before the entry becomes visible so stop/remove wait for the launch.
        let _op = entry
            .op
            .try_lock()
            .map_err(|_| Error::Internal("fresh sandbox entry is locked".to_string()))?;
        let id;
        {
            let mut sandboxes = self.sandboxes.write().map_err(|_| Error::lock_poisoned())?;
            if sandboxes.len() >= MAX_SANDBOXES {
                return Err(Error::ResourceExhausted(format!(
                    "maximum number of sandboxes ({MAX_SANDBOXES}) reached"
                )));
            }
            for existing in sandboxes.values() {
                let record = existing.record.lock().map_err(|_| Error::lock_poisoned())?;
                if record.config.metadata == config.metadata {
                    return Err(Error::SandboxAlreadyExists(format!(
                        "{}/{} (attempt {}) as {}",
                        config.metadata.namespace,
                        config.metadata.name,
                        config.metadata.attempt,
                        record.id
                    )));
                }
            }
            id = self.allocate_id(&sandboxes)?;
            entry
                .record
                .lock()
                .map_err(|_| Error::lock_poisoned())?
                .id
                .clone_from(&id);
            sandboxes.insert(id.clone(), Arc::clone(&entry));
        }
        // Unwinds the reservation on every exit, including a dropped future.
        let mut reservation = Reservation {
            manager: self,
            id: id.clone(),
            committed: false,
        };

        let spec = LaunchSpec {
            entity: EntityRef::Sandbox(id.clone()),
            mode: StarterMode::Sandbox,
            config: LaunchConfig {
                id: id.clone(),
                hostname: config.hostname.clone(),
                namespaces: ["net", "ipc", "uts"]
                    .into_iter()
                    .map(NamespaceSpec::create)
                    .collect(),
                keys_server: self.keys_server.clone(),
                ..LaunchConfig::default()
            },
            log_path: None,
        };

        let launched = match self.supervisor.launch(spec).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!(sandbox = %id, error = %e, "sandbox launch failed");
                return Err(e);
            }
        };

        let committed = {
            let mut record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            record.state = SandboxState::Ready;
            record.namespace = Some(NamespaceContext::for_pid(launched.handle.pid));
            record.handle = Some(launched.handle.clone());
            self.store.save(&id, &*record)
        };
        if let Err(e) = committed {
            warn!(sandbox = %id, error = %e, "failed to persist sandbox, tearing down");
            let _ = self.supervisor.signal(&launched.handle, Signal::Kill);
            let _ = self.supervisor.release(&launched.handle);
            return Err(e);
        }
        reservation.committed = true;
        entry.state.send_replace(SandboxState::Ready);
        self.watch(Arc::clone(&entry), launched.handle.clone(), launched.completion);

        info!(sandbox = %id, pid = launched.handle.pid, "sandbox ready");
        Ok(id)
    }

    fn forget(&self, id: &str) {
        if let Ok(mut sandboxes) = self.sandboxes.write() {
            sandboxes.remove(id);
        }
    }

    /// Consumes the completion of a sandbox starter.
    fn watch(&self, entry: Arc<SandboxEntry>, handle: StarterHandle, completion: Completion) {
        let store = self.store.clone();
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            // A closed channel means the watcher was detached on shutdown.
            let Ok(termination) = completion.await else {
                return;
            };
            if let Err(e) = commit_exit(&entry, &store, termination) {
                warn!(sandbox = %handle.entity.id(), error = %e, "failed to commit sandbox exit");
                return;
            }
            if let Err(e) = supervisor.release(&handle) {
                warn!(
                    sandbox = %handle.entity.id(),
                    error = %e,
                    "failed to release starter handle"
                );
            }
        });
    }

    /// Stops the sandbox's namespace context. Idempotent.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;

        let record = entry.snapshot()?;
        match record.state {
            SandboxState::NotReady | SandboxState::Removed => {
                debug!(sandbox = %id, "sandbox already stopped");
                return Ok(());
            }
            SandboxState::Created | SandboxState::Ready => {}
        }

        let Some(handle) = record.handle else {
            commit_exit(&entry, &self.store, Termination::Lost)?;
            return Ok(());
        };

        let mut state = entry.state.subscribe();
        let stopped = |s: &SandboxState| *s != SandboxState::Ready && *s != SandboxState::Created;

        self.supervisor.signal(&handle, Signal::Term)?;
        if tokio::time::timeout(SANDBOX_STOP_TIMEOUT, state.wait_for(stopped))
            .await
            .is_err()
        {
            info!(sandbox = %id, "sandbox did not stop in time, killing");
            self.supervisor.signal(&handle, Signal::Kill)?;
            if tokio::time::timeout(KILL_GRACE, state.wait_for(stopped))
                .await
                .is_err()
            {
                return Err(Error::Internal(format!(
                    "sandbox {id} did not exit after SIGKILL"
                )));
            }
        }

        info!(sandbox = %id, "sandbox stopped");
        Ok(())
    }

    /// Removes a stopped sandbox.
    ///
    /// `container_count` is evaluated while the sandbox record is locked so
    /// that no container can be bound to the sandbox concurrently.
    pub async fn remove(
        &self,
        id: &str,
        container_count: impl Fn(&str) -> Result<usize>,
    ) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;

        {
            let mut record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            if record.state != SandboxState::NotReady {
                return Err(Error::InvalidState {
                    entity: "pod sandbox",
                    id: id.to_string(),
                    state: record.state.to_string(),
                    expected: SandboxState::NotReady.to_string(),
                });
            }
            let count = container_count(id)?;
            if count > 0 {
                return Err(Error::SandboxNotEmpty {
                    id: id.to_string(),
                    count,
                });
            }
            self.store.remove(id)?;
            record.state = SandboxState::Removed;
        }
        entry.state.send_replace(SandboxState::Removed);

        {
            let mut sandboxes = self.sandboxes.write().map_err(|_| Error::lock_poisoned())?;
            sandboxes.remove(id);
        }
        self.retired
            .lock()
            .map_err(|_| Error::lock_poisoned())?
            .insert(id.to_string());

        info!(sandbox = %id, "sandbox removed");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self, id: &str) -> Result<SandboxStatus> {
        Ok(self.entry(id)?.snapshot()?.status())
    }

    pub fn list(&self, filter: &SandboxFilter) -> Result<Vec<SandboxStatus>> {
        let entries: Vec<Arc<SandboxEntry>> = {
            let sandboxes = self.sandboxes.read().map_err(|_| Error::lock_poisoned())?;
            sandboxes.values().cloned().collect()
        };
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = entry.snapshot()?;
            if filter.matches(&record) {
                statuses.push(record.status());
            }
        }
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(statuses)
    }

    /// Runs `f` with the record of a `READY` sandbox locked.
    pub(crate) fn with_ready<T>(
        &self,
        id: &str,
        f: impl FnOnce(&SandboxRecord) -> Result<T>,
    ) -> Result<T> {
        let entry = self.entry(id)?;
        let record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
        if record.state != SandboxState::Ready {
            return Err(Error::InvalidState {
                entity: "pod sandbox",
                id: id.to_string(),
                state: record.state.to_string(),
                expected: SandboxState::Ready.to_string(),
            });
        }
        f(&record)
    }

    /// Identities of all sandboxes.
    pub fn ids(&self) -> Result<Vec<String>> {
        let sandboxes = self.sandboxes.read().map_err(|_| Error::lock_poisoned())?;
        Ok(sandboxes.keys().cloned().collect())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Attaches a starter recovered on startup to its sandbox.
    ///
    /// Returns false when no live sandbox owns the handle.
    pub fn adopt(&self, handle: StarterHandle, completion: Completion) -> Result<bool> {
        let Ok(entry) = self.entry(handle.entity.id()) else {
            return Ok(false);
        };
        {
            // Only READY records are ever persisted with a starter behind them.
            let mut record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
            if record.state != SandboxState::Ready {
                return Ok(false);
            }
            record.handle = Some(handle.clone());
            self.store.save(&record.id, &*record)?;
        }
        self.watch(entry, handle, completion);
        Ok(true)
    }

    /// Marks every live sandbox that was not adopted as `NOTREADY`.
    ///
    /// Covers starters whose handle vanished or could not be read. A process
    /// still running behind a stale record handle is killed first.
    pub fn finish_recovery(&self, adopted: &HashSet<String>) -> Result<()> {
        let entries: Vec<(String, Arc<SandboxEntry>)> = {
            let sandboxes = self.sandboxes.read().map_err(|_| Error::lock_poisoned())?;
            sandboxes
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };
        for (id, entry) in entries {
            if adopted.contains(&id) {
                continue;
            }
            let record = entry.snapshot()?;
            if !matches!(record.state, SandboxState::Created | SandboxState::Ready) {
                continue;
            }
            warn!(sandbox = %id, "sandbox starter not recovered");
            if let Some(stale) = &record.handle
                && let Err(e) = self.supervisor.signal(stale, Signal::Kill)
            {
                warn!(sandbox = %id, error = %e, "failed to kill unrecovered starter");
            }
            commit_exit(&entry, &self.store, Termination::Lost)?;
        }
        Ok(())
    }
}

/// Sandbox entry inserted by `run` that has not reached `READY` yet.
struct Reservation<'a> {
    manager: &'a SandboxManager,
    id: String,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(sandbox = %self.id, "dropping sandbox reservation");
            self.manager.forget(&self.id);
        }
    }
}

/// Moves a sandbox to `NOTREADY` after its starter ended.
fn commit_exit(entry: &SandboxEntry, store: &RecordStore, termination: Termination) -> Result<()> {
    let next = {
        let mut record = entry.record.lock().map_err(|_| Error::lock_poisoned())?;
        if !record.state.can_transition_to(SandboxState::NotReady) {
            return Ok(());
        }
        record.state = SandboxState::NotReady;
        record.handle = None;
        record.stopped_at = Some(Utc::now());
        store.save(&record.id, &*record)?;
        info!(sandbox = %record.id, ?termination, "sandbox not ready");
        record.state
    };
    entry.state.send_replace(next);
    Ok(())
}
