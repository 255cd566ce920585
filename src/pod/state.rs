//! Pod sandbox state types.
//!
//! - `SandboxState`: lifecycle state machine
//! - `SandboxConfig`: configuration snapshot taken at creation
//! - `NamespaceContext`: namespaces containers of the sandbox join
//! - `SandboxRecord`: persisted record
//! - `SandboxStatus` / `SandboxFilter`: query types

use crate::runtime::labels_match;
use crate::starter::StarterHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// =============================================================================
// Sandbox State
// =============================================================================

/// Pod sandbox lifecycle state.
///
/// ```text
///   CREATED ──▶ READY ──▶ NOTREADY ──▶ REMOVED
/// ```
///
/// `REMOVED` is terminal. A failed launch never leaves a `CREATED` record
/// behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Created,
    Ready,
    #[serde(rename = "NOTREADY")]
    NotReady,
    Removed,
}

impl SandboxState {
    /// Returns true for states with no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Returns true if `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Ready)
                | (Self::Created, Self::NotReady)
                | (Self::Ready, Self::NotReady)
                | (Self::NotReady, Self::Removed)
        )
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Ready => write!(f, "READY"),
            Self::NotReady => write!(f, "NOTREADY"),
            Self::Removed => write!(f, "REMOVED"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Identifying metadata of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub attempt: u32,
}

/// Sandbox configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub metadata: SandboxMetadata,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Directory container log paths are relative to.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Namespace context held by the sandbox starter process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceContext {
    pub pid: i32,
    pub net: PathBuf,
    pub ipc: PathBuf,
    pub uts: PathBuf,
}

impl NamespaceContext {
    /// Namespace files of a running process.
    pub fn for_pid(pid: i32) -> Self {
        let ns = PathBuf::from(format!("/proc/{pid}/ns"));
        Self {
            pid,
            net: ns.join("net"),
            ipc: ns.join("ipc"),
            uts: ns.join("uts"),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Persisted sandbox record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub config: SandboxConfig,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub namespace: Option<NamespaceContext>,
    /// Starter process holding the namespaces while `READY`.
    #[serde(default)]
    pub handle: Option<StarterHandle>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    pub fn new(id: String, config: SandboxConfig) -> Self {
        Self {
            id,
            config,
            state: SandboxState::Created,
            created_at: Utc::now(),
            namespace: None,
            handle: None,
            stopped_at: None,
        }
    }

    pub fn status(&self) -> SandboxStatus {
        SandboxStatus {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state,
            created_at: self.created_at,
            pid: self.handle.as_ref().map(|h| h.pid),
            network_namespace: self.namespace.as_ref().map(|ns| ns.net.clone()),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
        }
    }
}

/// Sandbox status returned by status and list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub id: String,
    pub metadata: SandboxMetadata,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    pub pid: Option<i32>,
    pub network_namespace: Option<PathBuf>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Filter for `ListPodSandbox`. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<SandboxState>,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

impl SandboxFilter {
    pub fn matches(&self, record: &SandboxRecord) -> bool {
        self.id.as_ref().is_none_or(|id| *id == record.id)
            && self.state.is_none_or(|state| state == record.state)
            && labels_match(&record.config.labels, &self.label_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_transitions() {
        use SandboxState::*;
        assert!(Created.can_transition_to(Ready));
        assert!(Ready.can_transition_to(NotReady));
        assert!(NotReady.can_transition_to(Removed));
        assert!(!Ready.can_transition_to(Removed), "must stop before remove");
        assert!(!NotReady.can_transition_to(Ready));
        for next in [Created, Ready, NotReady, Removed] {
            assert!(!Removed.can_transition_to(next));
        }
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&SandboxState::NotReady).unwrap(), "\"NOTREADY\"");
        assert_eq!(serde_json::to_string(&SandboxState::Ready).unwrap(), "\"READY\"");
    }

    #[test]
    fn test_filter() {
        let mut config = SandboxConfig::default();
        config.labels.insert("app".to_string(), "web".to_string());
        let record = SandboxRecord::new("abc".to_string(), config);

        assert!(SandboxFilter::default().matches(&record));
        let by_state = SandboxFilter {
            state: Some(SandboxState::Ready),
            ..Default::default()
        };
        assert!(!by_state.matches(&record));
        let by_label = SandboxFilter {
            label_selector: [("app".to_string(), "web".to_string())].into(),
            ..Default::default()
        };
        assert!(by_label.matches(&record));
    }
}
