//! Installer daemon client.
//!
//! Delivery is fire-and-forget: one JSON message per connection. Whether the
//! install succeeded is reported later by the installer itself, to the
//! callback URL carried in `external`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSource {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

/// Where the installer reports the outcome of an externally requested install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUpdate {
    pub update_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMessage {
    pub command: String,
    pub sources: Vec<SnapSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalUpdate>,
}

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("cannot reach installer at {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },
    #[error("installer I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("installer message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snap list failed: {0}")]
    List(String),
}

impl From<InstallerError> for PipelineError {
    fn from(e: InstallerError) -> Self {
        PipelineError::Io(e.to_string())
    }
}

#[async_trait]
pub trait InstallerClient: Send + Sync {
    async fn deliver(&self, message: &InstallMessage) -> Result<(), InstallerError>;

    /// Installed snap name → version.
    async fn installed_versions(&self) -> Result<BTreeMap<String, String>, InstallerError>;
}

#[derive(Debug, Clone)]
pub struct SocketInstaller {
    socket: PathBuf,
    snap_binary: PathBuf,
}

impl SocketInstaller {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            snap_binary: PathBuf::from("snap"),
        }
    }
}

#[async_trait]
impl InstallerClient for SocketInstaller {
    async fn deliver(&self, message: &InstallMessage) -> Result<(), InstallerError> {
        let mut stream =
            UnixStream::connect(&self.socket)
                .await
                .map_err(|source| InstallerError::Connect {
                    path: self.socket.display().to_string(),
                    source,
                })?;
        let body = serde_json::to_vec(message)?;
        stream.write_all(&body).await?;
        stream.shutdown().await?;
        tracing::info!(sources = message.sources.len(), "install message delivered");
        Ok(())
    }

    async fn installed_versions(&self) -> Result<BTreeMap<String, String>, InstallerError> {
        let output = tokio::process::Command::new(&self.snap_binary)
            .arg("list")
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(InstallerError::List(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_snap_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `snap list` output (header line, then `name version rev ...`).
pub fn parse_snap_list(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            Some((cols.next()?.to_string(), cols.next()?.to_string()))
        })
        .collect()
}

// ── Mock ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockInner {
    installed: BTreeMap<String, String>,
    delivered: Vec<InstallMessage>,
    fail_deliver: bool,
}

/// In-memory installer for tests.
#[derive(Clone, Default)]
pub struct MockInstaller {
    inner: Arc<Mutex<MockInner>>,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_installed(&self, name: &str, version: &str) {
        self.inner
            .lock()
            .installed
            .insert(name.to_string(), version.to_string());
    }

    pub fn delivered(&self) -> Vec<InstallMessage> {
        self.inner.lock().delivered.clone()
    }

    pub fn fail_deliver(&self, fail: bool) {
        self.inner.lock().fail_deliver = fail;
    }
}

#[async_trait]
impl InstallerClient for MockInstaller {
    async fn deliver(&self, message: &InstallMessage) -> Result<(), InstallerError> {
        let mut inner = self.inner.lock();
        if inner.fail_deliver {
            return Err(InstallerError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected failure",
            )));
        }
        inner.delivered.push(message.clone());
        Ok(())
    }

    async fn installed_versions(&self) -> Result<BTreeMap<String, String>, InstallerError> {
        Ok(self.inner.lock().installed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_list_parses_name_and_version() {
        let text = "\
Name      Version  Rev   Tracking  Publisher  Notes
core      16-2.35  5548  stable    canonical  core
chuted    1.4.0    120   -         chuted     -
";
        let versions = parse_snap_list(text);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["chuted"], "1.4.0");
    }

    #[test]
    fn message_omits_missing_external() {
        let message = InstallMessage {
            command: "install".into(),
            sources: vec![SnapSource {
                name: "chuted".into(),
                version: "1.5.0".into(),
                path: "/tmp/chuted.snap".into(),
            }],
            external: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("external").is_none());
        assert_eq!(json["sources"][0]["version"], "1.5.0");
    }

    #[tokio::test]
    async fn mock_records_deliveries() {
        let mock = MockInstaller::new();
        let message = InstallMessage {
            command: "install".into(),
            sources: Vec::new(),
            external: None,
        };
        mock.deliver(&message).await.unwrap();
        assert_eq!(mock.delivered(), vec![message.clone()]);
        mock.fail_deliver(true);
        assert!(mock.deliver(&message).await.is_err());
    }
}
