//! Wire format.
//!
//! One JSON document per line in each direction:
//!
//! ```text
//! → {"method":"RunPodSandbox","config":{"metadata":{"name":"web","namespace":"default"}}}
//! ← {"status":"ok","data":{"pod_sandbox_id":"4f1c..."}}
//!
//! → {"method":"RemoveContainer","container_id":"nope"}
//! ← {"status":"error","code":"not_found","message":"container not found: nope"}
//! ```

use crate::container::{ContainerConfig, ContainerFilter};
use crate::error::{Error, ErrorKind};
use crate::image::AuthConfig;
use crate::pod::{SandboxConfig, SandboxFilter};
use serde::{Deserialize, Serialize};

/// A remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    Version,
    Status,

    RunPodSandbox {
        config: SandboxConfig,
    },
    StopPodSandbox {
        pod_sandbox_id: String,
    },
    RemovePodSandbox {
        pod_sandbox_id: String,
    },
    PodSandboxStatus {
        pod_sandbox_id: String,
    },
    ListPodSandbox {
        #[serde(default)]
        filter: SandboxFilter,
    },

    CreateContainer {
        pod_sandbox_id: String,
        config: ContainerConfig,
    },
    StartContainer {
        container_id: String,
    },
    StopContainer {
        container_id: String,
        /// Seconds to wait after SIGTERM.
        #[serde(default)]
        timeout: u64,
    },
    RemoveContainer {
        container_id: String,
    },
    ContainerStatus {
        container_id: String,
    },
    ListContainers {
        #[serde(default)]
        filter: ContainerFilter,
    },
    ExecSync {
        container_id: String,
        cmd: Vec<String>,
        /// Seconds; zero waits indefinitely.
        #[serde(default)]
        timeout: u64,
    },

    PullImage {
        image: String,
        #[serde(default)]
        auth: Option<AuthConfig>,
    },
    ListImages {
        #[serde(default)]
        filter: Option<String>,
    },
    ImageStatus {
        image: String,
    },
    RemoveImage {
        image: String,
    },
    ImageFsInfo,
}

impl Request {
    /// Method name, as logged by the interceptor.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Version => "Version",
            Self::Status => "Status",
            Self::RunPodSandbox { .. } => "RunPodSandbox",
            Self::StopPodSandbox { .. } => "StopPodSandbox",
            Self::RemovePodSandbox { .. } => "RemovePodSandbox",
            Self::PodSandboxStatus { .. } => "PodSandboxStatus",
            Self::ListPodSandbox { .. } => "ListPodSandbox",
            Self::CreateContainer { .. } => "CreateContainer",
            Self::StartContainer { .. } => "StartContainer",
            Self::StopContainer { .. } => "StopContainer",
            Self::RemoveContainer { .. } => "RemoveContainer",
            Self::ContainerStatus { .. } => "ContainerStatus",
            Self::ListContainers { .. } => "ListContainers",
            Self::ExecSync { .. } => "ExecSync",
            Self::PullImage { .. } => "PullImage",
            Self::ListImages { .. } => "ListImages",
            Self::ImageStatus { .. } => "ImageStatus",
            Self::RemoveImage { .. } => "RemoveImage",
            Self::ImageFsInfo => "ImageFsInfo",
        }
    }
}

/// Reply to a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        code: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Self::Ok { data }
    }

    pub fn error(error: &Error) -> Self {
        Self::Error {
            code: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Encodes the response as one line, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","code":"internal","message":"encoding failed: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_request() {
        let request: Request = serde_json::from_str(
            r#"{"method":"StopContainer","container_id":"c1","timeout":5}"#,
        )
        .unwrap();
        assert_eq!(request.method(), "StopContainer");
        match request {
            Request::StopContainer {
                container_id,
                timeout,
            } => {
                assert_eq!(container_id, "c1");
                assert_eq!(timeout, 5);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unit_request_and_defaults() {
        let request: Request = serde_json::from_str(r#"{"method":"Version"}"#).unwrap();
        assert_eq!(request.method(), "Version");

        let request: Request = serde_json::from_str(r#"{"method":"ListPodSandbox"}"#).unwrap();
        assert!(matches!(request, Request::ListPodSandbox { .. }));
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"method":"Reboot"}"#).is_err());
    }

    #[test]
    fn test_error_response_encoding() {
        let response = Response::error(&Error::ContainerNotFound("nope".to_string()));
        let line = response.to_line();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "not_found");
        assert_eq!(value["message"], "container not found: nope");
    }

    #[test]
    fn test_ok_response_encoding() {
        let response = Response::ok(serde_json::json!({"pod_sandbox_id": "abc"}));
        assert!(response.is_ok());
        let value: serde_json::Value = serde_json::from_str(&response.to_line()).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["pod_sandbox_id"], "abc");
    }
}
