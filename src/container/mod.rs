//! # Containers
//!
//! Containers run inside a `READY` pod sandbox. Each running container is a
//! starter process in `container` mode that joins the sandbox's network, IPC
//! and UTS namespaces and creates its own PID and mount namespaces.
//!
//! ```text
//! CreateContainer ──▶ CREATED ──StartContainer──▶ RUNNING ──exit──▶ EXITED
//!                        │                           │
//!                        │ start error / stop        └──lost──▶ UNKNOWN
//!                        ▼
//!                      EXITED
//! ```
//!
//! `RemoveContainer` is refused while `RUNNING`. Exec and attach require
//! `RUNNING`.

mod manager;
mod state;

pub use manager::{Attachment, ContainerManager};
pub use state::{
    ContainerConfig, ContainerFilter, ContainerMetadata, ContainerRecord, ContainerState,
    ContainerStatus, REASON_COMPLETED, REASON_ERROR, REASON_PROCESS_LOST, REASON_START_ERROR,
    REASON_STOPPED, START_ERROR_EXIT_CODE,
};
