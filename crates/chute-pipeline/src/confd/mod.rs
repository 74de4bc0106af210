//! OS-configuration daemon client.
//!
//! The daemon re-reads the generated network, firewall, DHCP and wireless
//! files and applies them. A reload answers with one status record per
//! section it touched.

pub mod mock;
pub mod socket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockConfd;
pub use socket::SocketConfd;

use crate::error::PipelineError;

/// Status of one section after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionStatus {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    /// Owner tag the section was generated with.
    #[serde(default)]
    pub comment: Option<String>,
    pub success: bool,
    /// Number of reloads since the section last changed; 0 means this one.
    #[serde(default)]
    pub age: u64,
}

impl SectionStatus {
    /// A fresh failure on a section `owner` generated.
    pub fn is_fatal_for(&self, owner: &str) -> bool {
        !self.success && self.age == 0 && self.comment.as_deref() == Some(owner)
    }
}

impl std::fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)?;
        if let Some(owner) = &self.comment {
            write!(f, " ({owner})")?;
        }
        write!(
            f,
            ": {} (age {})",
            if self.success { "ok" } else { "failed" },
            self.age
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfdError {
    #[error("cannot reach configuration daemon at {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration daemon I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad reply from configuration daemon: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration daemon error: {0}")]
    Remote(String),
}

impl From<ConfdError> for PipelineError {
    fn from(e: ConfdError) -> Self {
        PipelineError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfdError>;

#[async_trait]
pub trait ConfdClient: Send + Sync {
    /// Reload the sections generated by `name`.
    async fn reload(&self, name: &str) -> Result<Vec<SectionStatus>>;

    async fn reload_all(&self) -> Result<Vec<SectionStatus>>;

    /// Tear down every generated section.
    async fn unload_all(&self) -> Result<()>;

    /// Block until the daemon finished its initial configuration pass.
    async fn wait_system_up(&self) -> Result<()>;
}
