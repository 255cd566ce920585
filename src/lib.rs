//! # sycri
//!
//! **Container runtime shim over a privileged starter helper.**
//!
//! The crate exposes pod sandbox, container and image management to a
//! cluster orchestrator. Process isolation is delegated to the external
//! `starter` helper; the shim tracks lifecycle state, supervises the helper
//! processes, and resolves, pulls and indexes SIF images.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    server (JSON lines, Unix socket)                 │
//! │                   RuntimeService │ ImageManagementService           │
//! ├──────────────────────────────────┼──────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────────┐   ┌──────────────────────┐  │
//! │  │ SandboxManager│◀─│ ContainerManager │──▶│     ImageService     │  │
//! │  └──────┬───────┘  └────────┬─────────┘   │ resolve → pull → index│  │
//! │         │                   │             └──────────┬───────────┘  │
//! │         └────────┬──────────┘                        │              │
//! │            ┌─────▼──────┐                   library HTTPS │ docker  │
//! │            │ Supervisor │                        ImageFetcher       │
//! │            └─────┬──────┘                                           │
//! ├──────────────────┼──────────────────────────────────────────────────┤
//! │            starter <sandbox|container|exec> --config <file>         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycles
//!
//! ```text
//! Sandbox:    CREATED ──ready──▶ READY ──stop / exit──▶ NOTREADY ──remove──▶ REMOVED
//! Container:  CREATED ──start──▶ RUNNING ──exit──▶ EXITED
//!                │                  └──process lost──▶ UNKNOWN
//!                └──stop / start error──▶ EXITED
//! ```
//!
//! No transition ever leaves a terminal state.
//!
//! # Recovery
//!
//! Sandbox records, container records and starter handles are persisted as
//! JSON under the state directory. On start, [`RuntimeContext`] reconciles
//! each handle: live processes are adopted, dead ones drive their owner to a
//! terminal state.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sycri::{RuntimeConfig, RuntimeContext, RuntimeService, SandboxConfig};
//!
//! let context = Arc::new(RuntimeContext::start(RuntimeConfig::default()).await?);
//! let runtime = RuntimeService::new(context);
//! let id = runtime.run_pod_sandbox(SandboxConfig::default()).await?;
//! ```

pub mod config;
pub mod constants;
pub mod container;
pub mod context;
pub mod error;
pub mod image;
pub mod pod;
pub mod runtime;
pub mod server;
pub mod service;
pub mod starter;
pub mod state;

// Re-exports
pub use config::RuntimeConfig;
pub use container::{
    Attachment, ContainerConfig, ContainerFilter, ContainerManager, ContainerMetadata,
    ContainerState, ContainerStatus,
};
pub use context::RuntimeContext;
pub use error::{Error, ErrorKind, Result};
pub use image::{
    AuthConfig, ImageFetcher, ImageRecord, ImageRef, ImageService, ImageUsage, RegistryEndpoints,
    RegistryFetcher, RegistryKind,
};
pub use pod::{
    SandboxConfig, SandboxFilter, SandboxManager, SandboxMetadata, SandboxState, SandboxStatus,
};
pub use runtime::{ExecOptions, ExecResult, Signal, Termination};
pub use server::{Request, Response, Server};
pub use service::{ImageManagementService, RuntimeService};
pub use starter::{StarterHandle, Supervisor};
