use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SimdockError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("failed to create workspace directory {}: {source}", path.display())]
    WorkspaceCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("container '{name}' reported unrecognized state '{state}'; inspect it with the engine and retry")]
    UnknownContainerState { name: String, state: String },
    #[error("container '{0}' does not exist; run `simdock up` first")]
    ContainerMissing(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
}

impl SimdockError {
    pub fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details.clone()),
            Self::EngineUnavailable(_) => Some(ProcessErrorDetails {
                error_code: "engine_unavailable".to_string(),
                hint: Some(
                    "Install the container engine and make sure its daemon is running.".to_string(),
                ),
                command: None,
                raw_stderr: None,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

/// Problems that weaken the session but never stop it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Degradation {
    #[error("capability detection degraded: {0}")]
    CapabilityDetection(String),
    #[error("permission adjustment failed: {0}")]
    PermissionAdjustment(String),
    #[error("display auth setup failed: {0}")]
    DisplayAuthSetup(String),
}

impl Degradation {
    pub fn report(&self) {
        warn!("{self}");
    }
}

pub fn report_all(degradations: &[Degradation]) {
    for degradation in degradations {
        degradation.report();
    }
}
