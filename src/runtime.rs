//! Process-level types shared by the supervisor and the lifecycle managers.
//!
//! - [`Signal`]: signals delivered to starter processes
//! - [`Termination`]: how a supervised process ended
//! - [`EntityRef`]: the sandbox or container a starter process serves
//! - [`ExecOptions`] / [`ExecResult`]: exec requests and their captured output
//! - [`Mount`]: bind mounts handed to the starter

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a starter process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

// =============================================================================
// Termination
// =============================================================================

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    /// Process exited with a status code.
    Exited(i32),
    /// Process was killed by a signal.
    Signaled(i32),
    /// Process disappeared and its exit status was not observable.
    Lost,
}

impl Termination {
    /// Builds a termination from a child's exit status.
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signo)) => Self::Signaled(signo),
            (None, None) => Self::Lost,
        }
    }

    /// Exit code as reported to callers. Signals map to `128 + signo`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signo) => Some(128 + signo),
            Self::Lost => None,
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Lifecycle entity a starter process serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Sandbox(String),
    Container(String),
}

impl EntityRef {
    /// Identity of the entity.
    pub fn id(&self) -> &str {
        match self {
            Self::Sandbox(id) | Self::Container(id) => id,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sandbox(id) => write!(f, "sandbox {id}"),
            Self::Container(id) => write!(f, "container {id}"),
        }
    }
}

// =============================================================================
// Exec
// =============================================================================

/// Options for executing a command in a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Attach to stdin.
    pub stdin: bool,
    /// Allocate TTY.
    pub tty: bool,
    /// Environment variables to add.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub working_dir: Option<String>,
}

/// Result of a synchronous exec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Bind mount into a container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mount {
    /// Path inside the container.
    pub container_path: String,
    /// Path on the host.
    pub host_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
}

// =============================================================================
// Filters
// =============================================================================

/// Returns true when every selector pair is present in `labels`.
pub fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key).is_some_and(|v| v == value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_numbers() {
        assert_eq!(Signal::Term.as_i32(), libc::SIGTERM);
        assert_eq!(Signal::Kill.as_i32(), libc::SIGKILL);
        assert_eq!(Signal::Kill.to_string(), "SIGKILL");
    }

    #[test]
    fn test_termination_exit_codes() {
        assert_eq!(Termination::Exited(3).exit_code(), Some(3));
        assert_eq!(Termination::Signaled(9).exit_code(), Some(137));
        assert_eq!(Termination::Lost.exit_code(), None);
    }

    #[test]
    fn test_entity_ref_serialization() {
        let entity = EntityRef::Container("abc".to_string());
        let json = serde_json::to_string(&entity).unwrap();
        assert_eq!(json, r#"{"kind":"container","id":"abc"}"#);
        let back: EntityRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_label_selector() {
        let labels: HashMap<String, String> = [("app", "web"), ("tier", "front")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut selector = HashMap::new();
        assert!(labels_match(&labels, &selector), "empty selector matches");
        selector.insert("app".to_string(), "web".to_string());
        assert!(labels_match(&labels, &selector));
        selector.insert("tier".to_string(), "back".to_string());
        assert!(!labels_match(&labels, &selector));
    }
}
