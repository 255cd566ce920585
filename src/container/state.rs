//! Container state types.

use crate::runtime::{Mount, Termination, labels_match};
use crate::starter::StarterHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Reason of a container that exited with code 0.
pub const REASON_COMPLETED: &str = "Completed";
/// Reason of a container that exited with a non-zero code or a signal.
pub const REASON_ERROR: &str = "Error";
/// Reason of a container whose starter failed to launch.
pub const REASON_START_ERROR: &str = "StartError";
/// Reason of a container whose process vanished without an exit status.
pub const REASON_PROCESS_LOST: &str = "ProcessLost";
/// Reason of a container stopped before it was started.
pub const REASON_STOPPED: &str = "Stopped";

/// Exit code recorded for a failed start.
pub const START_ERROR_EXIT_CODE: i32 = 128;

// =============================================================================
// Container State
// =============================================================================

/// Container lifecycle state.
///
/// ```text
///   CREATED ──▶ RUNNING ──▶ EXITED
///      │           │
///      │           └──▶ UNKNOWN   (process lost)
///      └──▶ EXITED                (start error, stopped before start)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerState {
    /// `EXITED` and `UNKNOWN` have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Unknown)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Exited)
                | (Self::Running, Self::Exited)
                | (Self::Running, Self::Unknown)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Exited => write!(f, "EXITED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Identifying metadata of a container inside its sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

/// Container run specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    /// Image reference or resolved identity.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Log file, relative to the sandbox log directory when not absolute.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub tty: bool,
}

// =============================================================================
// Records
// =============================================================================

/// Persisted container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub sandbox_id: String,
    pub config: ContainerConfig,
    pub state: ContainerState,
    /// Resolved image identity.
    pub image_id: String,
    pub image_path: PathBuf,
    /// Absolute log file path.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub handle: Option<StarterHandle>,
}

impl ContainerRecord {
    /// Applies the termination of the container process.
    ///
    /// Returns false when the record is not `RUNNING`.
    pub fn apply_termination(&mut self, termination: Termination) -> bool {
        let next = match termination {
            Termination::Lost => ContainerState::Unknown,
            _ => ContainerState::Exited,
        };
        if !self.state.can_transition_to(next) || self.state != ContainerState::Running {
            return false;
        }
        self.state = next;
        self.finished_at = Some(Utc::now());
        self.handle = None;
        self.exit_code = termination.exit_code();
        self.reason = Some(
            match termination {
                Termination::Lost => REASON_PROCESS_LOST,
                Termination::Exited(0) => REASON_COMPLETED,
                _ => REASON_ERROR,
            }
            .to_string(),
        );
        true
    }

    /// Marks a container whose start failed.
    pub fn apply_start_error(&mut self, message: String) {
        self.state = ContainerState::Exited;
        self.finished_at = Some(Utc::now());
        self.exit_code = Some(START_ERROR_EXIT_CODE);
        self.reason = Some(REASON_START_ERROR.to_string());
        self.message = Some(message);
    }

    pub fn status(&self) -> ContainerStatus {
        ContainerStatus {
            id: self.id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state,
            image: self.config.image.clone(),
            image_id: self.image_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            reason: self.reason.clone(),
            message: self.message.clone(),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            log_path: self.log_path.clone(),
        }
    }
}

/// Container status returned by status and list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub state: ContainerState,
    pub image: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub log_path: Option<PathBuf>,
}

/// Filter for `ListContainers`. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<ContainerState>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

impl ContainerFilter {
    pub fn matches(&self, record: &ContainerRecord) -> bool {
        self.id.as_ref().is_none_or(|id| *id == record.id)
            && self.state.is_none_or(|state| state == record.state)
            && self
                .sandbox_id
                .as_ref()
                .is_none_or(|sandbox| *sandbox == record.sandbox_id)
            && labels_match(&record.config.labels, &self.label_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> ContainerRecord {
        ContainerRecord {
            id: "c1".to_string(),
            sandbox_id: "s1".to_string(),
            config: ContainerConfig::default(),
            state: ContainerState::Running,
            image_id: "app.sif".to_string(),
            image_path: PathBuf::from("/store/app.sif"),
            log_path: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_code: None,
            reason: None,
            message: None,
            handle: None,
        }
    }

    #[test]
    fn test_container_transitions() {
        use ContainerState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Exited));
        assert!(Running.can_transition_to(Unknown));
        assert!(!Created.can_transition_to(Unknown));
        for terminal in [Exited, Unknown] {
            assert!(terminal.is_terminal());
            for next in [Created, Running, Exited, Unknown] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_termination_reasons() {
        let mut record = running();
        assert!(record.apply_termination(Termination::Exited(0)));
        assert_eq!(record.reason.as_deref(), Some(REASON_COMPLETED));
        assert_eq!(record.exit_code, Some(0));
        assert!(
            !record.apply_termination(Termination::Lost),
            "no transition out of EXITED"
        );

        let mut record = running();
        record.apply_termination(Termination::Signaled(15));
        assert_eq!(record.state, ContainerState::Exited);
        assert_eq!(record.exit_code, Some(143));
        assert_eq!(record.reason.as_deref(), Some(REASON_ERROR));

        let mut record = running();
        record.apply_termination(Termination::Lost);
        assert_eq!(record.state, ContainerState::Unknown);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.reason.as_deref(), Some(REASON_PROCESS_LOST));
    }

    #[test]
    fn test_start_error() {
        let mut record = running();
        record.state = ContainerState::Created;
        record.apply_start_error("no such image".to_string());
        assert_eq!(record.state, ContainerState::Exited);
        assert_eq!(record.exit_code, Some(START_ERROR_EXIT_CODE));
        assert_eq!(record.reason.as_deref(), Some(REASON_START_ERROR));
    }
}
