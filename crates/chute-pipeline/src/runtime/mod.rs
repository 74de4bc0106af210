//! Container runtime interface.
//!
//! The pipeline drives the container engine only through `ContainerRuntime`.
//! `DockerCli` talks to a real engine through its CLI; `MockRuntime` keeps
//! container state in memory for tests and dry runs.

pub mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerCli;
pub use mock::MockRuntime;

use crate::error::PipelineError;

/// Label every chute container carries; the value is the chute name.
pub const CHUTE_LABEL: &str = "chuted.chute";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container {name} is {status}")]
    Conflict { name: String, status: String },

    #[error("{command} exited with {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<RuntimeError> for PipelineError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(_) | RuntimeError::Conflict { .. } => {
                PipelineError::StateConflict(e.to_string())
            }
            other => PipelineError::Io(format!("container runtime: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Pull an external reference.
    External { reference: String },
    /// Generate a Dockerfile on top of a base runtime image.
    Light { base: String, command: Vec<String> },
    /// Build from a context directory holding a Dockerfile.
    Context { dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub tag: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPublish {
    pub host: u16,
    pub container: u16,
    pub protocol: String,
}

/// A host interface moved into the container's network namespace at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAttachment {
    pub host_intf: String,
    pub container_intf: String,
    /// Address with prefix, e.g. `192.168.128.2/24`.
    pub address: String,
    pub gateway: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortPublish>,
    pub capabilities: Vec<String>,
    pub cpu_shares: u64,
    pub memory: Option<u64>,
    pub labels: BTreeMap<String, String>,
    pub attachments: Vec<NetAttachment>,
}

// ── Inspect result ────────────────────────────────────────────────────────────

/// Subset of the engine's inspect document the pipeline relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub name: String,
    pub state: ContainerState,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// `KEY=value` entries; the engine reports `null` for none.
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    #[serde(default)]
    pub pid: u32,
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(default)]
    pub ports: BTreeMap<String, Option<Vec<PortMapping>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

impl ContainerInspect {
    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.config
            .env
            .iter()
            .flatten()
            .find_map(|entry| entry.strip_prefix(key)?.strip_prefix('='))
    }
}

/// Trait for container engines.
///
/// Implementations are plain clients: they do not consult the chute store
/// and do not enforce lifecycle rules beyond what the engine reports.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g. "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// Pull or build the image named by `spec.tag`.
    async fn prepare_image(&self, spec: &ImageSpec) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;

    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn restart(&self, name: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Inspect a container; `None` when it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspect>>;

    /// Names of all containers carrying `CHUTE_LABEL`.
    async fn list_chute_containers(&self) -> Result<Vec<String>>;
}
