//! # Unix Socket Server
//!
//! Serves both facades over newline-delimited JSON on a Unix domain socket.
//!
//! ```text
//!  client ──line──▶ connection task ──▶ Server::handle ──▶ dispatch ──▶ facade
//!                                         │ interceptor: method, request,
//!                                         │ response or error, duration
//!  client ◀──line── connection task ◀─────┘
//! ```
//!
//! ## Shutdown
//!
//! 1. Stop accepting; connections finish the request they are processing
//! 2. Wait up to the configured grace period for connections to drain
//! 3. Cancel the runtime context (pulls and launches abort) and detach watchers
//! 4. Abort leftover connections and remove the socket file

mod protocol;

pub use protocol::{Request, Response};

use crate::context::RuntimeContext;
use crate::error::{Error, Result};
use crate::service::{ImageManagementService, RuntimeService};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Socket permissions: owner and group only.
const SOCKET_MODE: u32 = 0o660;

/// Request dispatcher bound to one runtime context.
#[derive(Clone)]
pub struct Server {
    context: Arc<RuntimeContext>,
    runtime: RuntimeService,
    images: ImageManagementService,
}

impl Server {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self {
            runtime: RuntimeService::new(Arc::clone(&context)),
            images: ImageManagementService::new(Arc::clone(&context)),
            context,
        }
    }

    /// Handles one request line and returns the response line.
    ///
    /// This is the interceptor: every call is logged with its method,
    /// request, outcome and duration.
    pub async fn handle(&self, line: &str) -> Response {
        let started = Instant::now();
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let error = Error::InvalidArgument(format!("malformed request: {e}"));
                warn!(request = %line, error = %error, "rejected request");
                return Response::error(&error);
            }
        };

        let method = request.method();
        debug!(method, ?request, "request");
        let response = match self.dispatch(request).await {
            Ok(data) => Response::ok(data),
            Err(e) => Response::error(&e),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &response {
            Response::Ok { data } => {
                info!(method, duration_ms, "call succeeded");
                debug!(method, response = %data, "response");
            }
            Response::Error { code, message } => {
                warn!(method, duration_ms, %code, error = %message, "call failed");
            }
        }
        response
    }

    async fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        let runtime = &self.runtime;
        let images = &self.images;
        match request {
            Request::Version => data(runtime.version()),
            Request::Status => data(runtime.status()),

            Request::RunPodSandbox { config } => {
                let id = runtime.run_pod_sandbox(config).await?;
                Ok(json!({ "pod_sandbox_id": id }))
            }
            Request::StopPodSandbox { pod_sandbox_id } => {
                runtime.stop_pod_sandbox(&pod_sandbox_id).await?;
                Ok(json!({}))
            }
            Request::RemovePodSandbox { pod_sandbox_id } => {
                runtime.remove_pod_sandbox(&pod_sandbox_id).await?;
                Ok(json!({}))
            }
            Request::PodSandboxStatus { pod_sandbox_id } => {
                data(runtime.pod_sandbox_status(&pod_sandbox_id)?)
            }
            Request::ListPodSandbox { filter } => data(runtime.list_pod_sandbox(&filter)?),

            Request::CreateContainer {
                pod_sandbox_id,
                config,
            } => {
                let id = runtime.create_container(&pod_sandbox_id, config)?;
                Ok(json!({ "container_id": id }))
            }
            Request::StartContainer { container_id } => {
                runtime.start_container(&container_id).await?;
                Ok(json!({}))
            }
            Request::StopContainer {
                container_id,
                timeout,
            } => {
                runtime.stop_container(&container_id, timeout).await?;
                Ok(json!({}))
            }
            Request::RemoveContainer { container_id } => {
                runtime.remove_container(&container_id).await?;
                Ok(json!({}))
            }
            Request::ContainerStatus { container_id } => {
                data(runtime.container_status(&container_id)?)
            }
            Request::ListContainers { filter } => data(runtime.list_containers(&filter)?),
            Request::ExecSync {
                container_id,
                cmd,
                timeout,
            } => data(runtime.exec_sync(&container_id, &cmd, timeout).await?),

            Request::PullImage { image, auth } => {
                let id = images.pull_image(&image, auth.as_ref()).await?;
                Ok(json!({ "image_ref": id }))
            }
            Request::ListImages { filter } => data(images.list_images(filter.as_deref())?),
            Request::ImageStatus { image } => data(images.image_status(&image)?),
            Request::RemoveImage { image } => {
                images.remove_image(&image)?;
                Ok(json!({}))
            }
            Request::ImageFsInfo => data(images.image_fs_info()?),
        }
    }

    /// Binds `socket_path` and serves until `shutdown` resolves.
    pub async fn serve(self, socket_path: &Path, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = bind(socket_path)?;
        info!(socket = %socket_path.display(), "listening");

        let draining = CancellationToken::new();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        let draining = draining.clone();
                        connections.spawn(async move {
                            if let Err(e) = server.connection(stream, draining).await {
                                debug!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                () = &mut shutdown => break,
            }
        }

        info!(in_flight = connections.len(), "shutting down, draining connections");
        drop(listener);
        draining.cancel();
        let grace = self.context.config().shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "grace period elapsed, cancelling");
        }

        self.context.shutdown();
        connections.shutdown().await;
        if let Err(e) = std::fs::remove_file(socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(socket = %socket_path.display(), error = %e, "failed to remove socket");
        }
        info!("server stopped");
        Ok(())
    }

    async fn connection(&self, stream: UnixStream, draining: CancellationToken) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = draining.cancelled() => break,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle(&line).await;
            writer.write_all(response.to_line().as_bytes()).await?;
        }
        Ok(())
    }
}

fn data<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Binds the listener, replacing a stale socket file.
fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::StorageInitFailed {
            path: parent.to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    }
    Ok(listener)
}
