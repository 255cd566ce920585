//! # Runtime Context
//!
//! The single process-wide value holding every manager. Built once by
//! [`RuntimeContext::start`] and torn down by [`RuntimeContext::shutdown`].
//!
//! ## Startup Order
//!
//! ```text
//! Supervisor ──▶ ImageService ──▶ SandboxManager ──▶ ContainerManager
//!                                                          │
//!                     reconcile() ◀────────────────────────┘
//!                         │
//!          adopt by owner, else kill + release
//!                         │
//!     finish_recovery(adopted): the rest goes NOTREADY / UNKNOWN
//! ```
//!
//! Any failure before the context is returned aborts startup; no partially
//! constructed service is ever exposed.

use crate::config::RuntimeConfig;
use crate::container::ContainerManager;
use crate::error::Result;
use crate::image::{ImageFetcher, ImageService, RegistryFetcher};
use crate::pod::SandboxManager;
use crate::runtime::{EntityRef, Signal};
use crate::starter::{Recovered, Supervisor};
use crate::state::RecordStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide service state.
pub struct RuntimeContext {
    config: RuntimeConfig,
    cancel: CancellationToken,
    supervisor: Arc<Supervisor>,
    images: Arc<ImageService>,
    sandboxes: Arc<SandboxManager>,
    containers: Arc<ContainerManager>,
}

impl RuntimeContext {
    /// Builds the context with the production registry fetcher.
    pub async fn start(config: RuntimeConfig) -> Result<Self> {
        let fetcher = Arc::new(RegistryFetcher::new(&config.singularity_path)?);
        Self::with_fetcher(config, fetcher).await
    }

    /// Builds the context with a custom image fetcher.
    pub async fn with_fetcher(
        config: RuntimeConfig,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            &config.starter_path,
            config.starters_dir(),
            cancel.child_token(),
        )?);

        let images = Arc::new(ImageService::open(
            &config.store_dir,
            config.endpoints.clone(),
            fetcher,
            cancel.child_token(),
        )?);

        let keys_server = Some(config.endpoints.keys.clone()).filter(|k| !k.is_empty());
        let sandboxes = Arc::new(SandboxManager::load(
            Arc::clone(&supervisor),
            RecordStore::open(config.sandboxes_dir())?,
            keys_server.clone(),
        )?);
        let containers = Arc::new(ContainerManager::load(
            Arc::clone(&supervisor),
            Arc::clone(&sandboxes),
            Arc::clone(&images),
            RecordStore::open(config.containers_dir())?,
            keys_server,
        )?);

        let context = Self {
            config,
            cancel,
            supervisor,
            images,
            sandboxes,
            containers,
        };
        context.recover()?;

        info!(
            state = %context.config.state_dir.display(),
            store = %context.config.store_dir.display(),
            "runtime context started"
        );
        Ok(context)
    }

    /// Hands every persisted starter back to its owner.
    fn recover(&self) -> Result<()> {
        let recovered = self.supervisor.reconcile()?;
        let count = recovered.len();
        let mut adopted_sandboxes = HashSet::new();
        let mut adopted_containers = HashSet::new();
        for Recovered { handle, completion } in recovered {
            let adopted = match &handle.entity {
                EntityRef::Sandbox(id) => {
                    let adopted = self.sandboxes.adopt(handle.clone(), completion)?;
                    adopted && adopted_sandboxes.insert(id.clone())
                }
                EntityRef::Container(id) => {
                    let adopted = self.containers.adopt(handle.clone(), completion)?;
                    adopted && adopted_containers.insert(id.clone())
                }
            };
            if !adopted {
                warn!(entity = %handle.entity, pid = handle.pid, "no owner for starter, killing");
                if let Err(e) = self.supervisor.signal(&handle, Signal::Kill) {
                    warn!(entity = %handle.entity, error = %e, "failed to kill orphaned starter");
                }
                self.supervisor.release(&handle)?;
            }
        }

        self.sandboxes.finish_recovery(&adopted_sandboxes)?;
        self.containers.finish_recovery(&adopted_containers)?;
        if count > 0 {
            info!(count, "starter handles reconciled");
        }
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageService> {
        &self.images
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels pulls and launches and detaches process watchers.
    ///
    /// Running sandboxes and containers keep running; the next start adopts
    /// them.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.supervisor.detach();
        info!("runtime context shut down");
    }
}
