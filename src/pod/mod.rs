//! # Pod Sandboxes
//!
//! A pod sandbox is the shared namespace context (network, IPC, UTS) that the
//! containers of one pod join. The context is held open by a starter process
//! running in `sandbox` mode:
//!
//! ```text
//! RunPodSandbox ──▶ starter sandbox ──▶ {"status":"ready"} ──▶ READY
//!                                                                │
//!        StopPodSandbox (SIGTERM, then SIGKILL) / starter exit ──┘
//!                                                                ▼
//!                                                            NOTREADY
//!                                                                │
//!        RemovePodSandbox (no containers left) ──────────────────┘
//!                                                                ▼
//!                                                             REMOVED
//! ```

mod manager;
mod state;

pub use manager::SandboxManager;
pub use state::{
    NamespaceContext, SandboxConfig, SandboxFilter, SandboxMetadata, SandboxRecord, SandboxState,
    SandboxStatus,
};
