//! Optional side services configured from the host config: the zerotier
//! overlay and the telemetry agent.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chute_core::fs::write_atomic;
use chute_core::hostconfig::{TelemetryConfig, ZerotierConfig};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{PipelineError, Result};

#[async_trait]
pub trait HostServices: Send + Sync {
    /// Join exactly the configured networks (none when disabled).
    async fn apply_zerotier(&self, config: &ZerotierConfig) -> Result<()>;

    async fn apply_telemetry(&self, config: &TelemetryConfig) -> Result<()>;

    /// Containers the telemetry agent should scrape.
    async fn set_telemetry_targets(&self, containers: &[String]) -> Result<()>;
}

/// Drives `zerotier-cli` and writes the telemetry agent's files.
#[derive(Debug, Clone)]
pub struct CommandHostServices {
    pub zerotier_cli: PathBuf,
    pub telemetry_settings: PathBuf,
    pub telemetry_targets: PathBuf,
}

#[derive(Deserialize)]
struct ZtNetwork {
    nwid: String,
}

impl CommandHostServices {
    async fn zerotier(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(&self.zerotier_cli)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::io(format!("spawn {}", self.zerotier_cli.display()), e))?;
        if !output.status.success() {
            return Err(PipelineError::Io(format!(
                "zerotier-cli {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl HostServices for CommandHostServices {
    async fn apply_zerotier(&self, config: &ZerotierConfig) -> Result<()> {
        let joined: Vec<ZtNetwork> = serde_json::from_str(&self.zerotier(&["-j", "listnetworks"]).await?)?;
        let joined: BTreeSet<String> = joined.into_iter().map(|n| n.nwid).collect();
        let wanted: BTreeSet<String> = if config.enabled {
            config.networks.iter().cloned().collect()
        } else {
            BTreeSet::new()
        };

        for nwid in joined.difference(&wanted) {
            self.zerotier(&["leave", nwid]).await?;
            tracing::info!(network = %nwid, "zerotier network left");
        }
        for nwid in wanted.difference(&joined) {
            self.zerotier(&["join", nwid]).await?;
            tracing::info!(network = %nwid, "zerotier network joined");
        }
        Ok(())
    }

    async fn apply_telemetry(&self, config: &TelemetryConfig) -> Result<()> {
        let body = serde_json::to_vec_pretty(config)?;
        write_atomic(&self.telemetry_settings, &body).map_err(|e| {
            PipelineError::io(format!("write {}", self.telemetry_settings.display()), e)
        })
    }

    async fn set_telemetry_targets(&self, containers: &[String]) -> Result<()> {
        let body = serde_json::to_vec_pretty(containers)?;
        write_atomic(&self.telemetry_targets, &body).map_err(|e| {
            PipelineError::io(format!("write {}", self.telemetry_targets.display()), e)
        })
    }
}

// ── Mock ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockInner {
    zerotier: Option<ZerotierConfig>,
    telemetry: Option<TelemetryConfig>,
    targets: Vec<String>,
    calls: Vec<String>,
    fail_zerotier: bool,
}

#[derive(Clone, Default)]
pub struct MockHostServices {
    inner: Arc<Mutex<MockInner>>,
}

impl MockHostServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zerotier(&self) -> Option<ZerotierConfig> {
        self.inner.lock().zerotier.clone()
    }

    pub fn telemetry(&self) -> Option<TelemetryConfig> {
        self.inner.lock().telemetry.clone()
    }

    pub fn targets(&self) -> Vec<String> {
        self.inner.lock().targets.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn fail_zerotier(&self, fail: bool) {
        self.inner.lock().fail_zerotier = fail;
    }
}

#[async_trait]
impl HostServices for MockHostServices {
    async fn apply_zerotier(&self, config: &ZerotierConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push("zerotier".into());
        if inner.fail_zerotier {
            return Err(PipelineError::Io("injected failure: zerotier".into()));
        }
        inner.zerotier = Some(config.clone());
        Ok(())
    }

    async fn apply_telemetry(&self, config: &TelemetryConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push("telemetry".into());
        inner.telemetry = Some(config.clone());
        Ok(())
    }

    async fn set_telemetry_targets(&self, containers: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push("targets".into());
        inner.targets = containers.to_vec();
        Ok(())
    }
}
