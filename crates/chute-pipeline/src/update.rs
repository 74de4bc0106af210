//! Update objects: one pending change to the node.
//!
//! A descriptor arrives from the controller (or the local intake socket) and
//! is checked for shape by `UpdateManager::add`. The worker turns it into an
//! `Update`, snapshots `old` from the store and builds `new` just before
//! planning, so queued updates observe everything that ran before them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chute_core::{Chute, ChuteSpec, ChuteState, HostConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{PipelineError, Result};
use crate::installer::{ExternalUpdate, SnapSource};
use crate::patch::PatchOp;
use crate::plan::PlanMap;
use crate::reporter::ProgressSink;
use crate::runtime::VolumeMount;
use crate::steps::devices::SystemDevices;
use crate::steps::network::ChuteInterface;
use crate::steps::resources::Allocation;
use crate::store::ChuteStore;
use crate::uci::{ConfigKind, Section, HOST_OWNER};

// ── Descriptor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateClass {
    Chute,
    HostConfig,
    Router,
    Snap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Create,
    Update,
    Start,
    Stop,
    Restart,
    Delete,
    PatchHostConfig,
    FactoryReset,
    Install,
}

impl UpdateType {
    /// Whether the type is legal for `class`.
    pub fn belongs_to(self, class: UpdateClass) -> bool {
        use UpdateType::*;
        match class {
            UpdateClass::Chute => matches!(self, Create | Update | Start | Stop | Restart | Delete),
            UpdateClass::HostConfig => self == PatchHostConfig,
            UpdateClass::Router => self == FactoryReset,
            UpdateClass::Snap => self == Install,
        }
    }
}

impl std::fmt::Display for UpdateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UpdateClass::Chute => "chute",
            UpdateClass::HostConfig => "host-config",
            UpdateClass::Router => "router",
            UpdateClass::Snap => "snap",
        })
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UpdateType::Create => "create",
            UpdateType::Update => "update",
            UpdateType::Start => "start",
            UpdateType::Stop => "stop",
            UpdateType::Restart => "restart",
            UpdateType::Delete => "delete",
            UpdateType::PatchHostConfig => "patchhostconfig",
            UpdateType::FactoryReset => "factoryreset",
            UpdateType::Install => "install",
        })
    }
}

/// A change request as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub class: UpdateClass,
    #[serde(rename = "type")]
    pub kind: UpdateType,
    #[serde(default)]
    pub name: Option<String>,
    /// Caller sequence number. Assigned by the manager when absent.
    #[serde(default)]
    pub tok: Option<u64>,
    /// Controller-side id; progress is only posted remotely when present.
    #[serde(default)]
    pub update_id: Option<String>,
    #[serde(default)]
    pub new: Option<ChuteSpec>,
    #[serde(default)]
    pub patch: Option<Vec<PatchOp>>,
    #[serde(default)]
    pub sources: Vec<SnapSource>,
    #[serde(default)]
    pub external: Option<ExternalUpdate>,
}

impl UpdateDescriptor {
    pub fn new(class: UpdateClass, kind: UpdateType) -> Self {
        Self {
            class,
            kind,
            name: None,
            tok: None,
            update_id: None,
            new: None,
            patch: None,
            sources: Vec::new(),
            external: None,
        }
    }

    /// Check the descriptor's shape. Nothing outside the descriptor is consulted.
    pub fn validate(&self) -> Result<()> {
        if !self.kind.belongs_to(self.class) {
            return Err(PipelineError::Validation(format!(
                "update type {} is not valid for class {}",
                self.kind, self.class
            )));
        }
        if self.class == UpdateClass::Chute
            && self.name.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(PipelineError::Validation(
                "chute updates require a name".into(),
            ));
        }
        match self.kind {
            UpdateType::Create | UpdateType::Update if self.new.is_none() => {
                Err(PipelineError::Validation(format!(
                    "{} requires a chute descriptor",
                    self.kind
                )))
            }
            UpdateType::PatchHostConfig if self.patch.is_none() => Err(
                PipelineError::Validation("patchhostconfig requires a patch".into()),
            ),
            UpdateType::Install if self.sources.is_empty() => Err(PipelineError::Validation(
                "install requires at least one source".into(),
            )),
            _ => Ok(()),
        }
    }
}

// ── State and outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Queued,
    Planning,
    Executing,
    Succeeded,
    Failed,
    Aborted,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Succeeded | UpdateState::Failed | UpdateState::Aborted
        )
    }
}

/// What the caller receives when an update finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub id: u64,
    pub tok: u64,
    pub state: UpdateState,
    pub success: bool,
    pub message: String,
    pub progress: Vec<String>,
}

pub type UpdateCallback = Box<dyn FnOnce(&UpdateOutcome) + Send + 'static>;

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Cache keys. Writers and readers are listed next to each key.
pub mod keys {
    /// `GetSystemDevices` → network layout, host config generation.
    pub const DEVICES: &str = "systemDevices";
    /// `GetHostConfig` / `SetHostConfig` → generators, host services.
    pub const HOST_CONFIG: &str = "hostConfig";
    /// `SetHostConfig` → `RestoreHostConfig`.
    pub const HOST_CONFIG_SNAPSHOT: &str = "hostConfigSnapshot";
    /// `ComputeNetwork` → firewall, DHCP, wireless, container create.
    pub const INTERFACES: &str = "networkInterfaces";
    /// `ComputeResources` → container create.
    pub const ALLOCATION: &str = "resourceAllocation";
    /// `GetVirtPreamble` → container create.
    pub const VOLUMES: &str = "volumes";
    pub const API_TOKEN: &str = "apiToken";
    /// `ComputeNetwork` → rollback recreate of the previous chute.
    pub const PREVIOUS_INTERFACES: &str = "previousInterfaces";
    /// `RemoveContainers` → rollback recreate of the previous chute.
    pub const PREVIOUS_TOKEN: &str = "previousApiToken";
}

/// Generated sections for one OS config file (`sections:<file>`).
pub fn sections_key(kind: ConfigKind) -> String {
    format!("sections:{kind}")
}

/// File text captured before the first write this update (`snapshot:<file>`).
pub fn snapshot_key(kind: ConfigKind) -> String {
    format!("snapshot:{kind}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Devices(SystemDevices),
    HostConfig(Box<HostConfig>),
    Interfaces(Vec<ChuteInterface>),
    Sections(Vec<Section>),
    /// File text, `None` when the file did not exist.
    Snapshot(Option<String>),
    Allocation(BTreeMap<String, Allocation>),
    Volumes(Vec<VolumeMount>),
    Token(String),
}

/// Scratchpad shared by the steps of one update; dropped with the update.
#[derive(Debug, Clone, Default)]
pub struct UpdateCache {
    entries: BTreeMap<String, CacheValue>,
}

impl UpdateCache {
    pub fn set(&mut self, key: impl Into<String>, value: CacheValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&CacheValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheValue> {
        self.entries.remove(key)
    }

    pub fn devices(&self) -> Option<&SystemDevices> {
        match self.get(keys::DEVICES) {
            Some(CacheValue::Devices(d)) => Some(d),
            _ => None,
        }
    }

    pub fn host_config(&self) -> Option<&HostConfig> {
        match self.get(keys::HOST_CONFIG) {
            Some(CacheValue::HostConfig(c)) => Some(c),
            _ => None,
        }
    }

    pub fn interfaces(&self) -> &[ChuteInterface] {
        match self.get(keys::INTERFACES) {
            Some(CacheValue::Interfaces(i)) => i,
            _ => &[],
        }
    }

    /// Layout the chute had before this update.
    pub fn previous_interfaces(&self) -> &[ChuteInterface] {
        match self.get(keys::PREVIOUS_INTERFACES) {
            Some(CacheValue::Interfaces(i)) => i,
            _ => &[],
        }
    }

    pub fn sections(&self, kind: ConfigKind) -> &[Section] {
        match self.get(&sections_key(kind)) {
            Some(CacheValue::Sections(s)) => s,
            _ => &[],
        }
    }

    pub fn push_sections(&mut self, kind: ConfigKind, sections: Vec<Section>) {
        let key = sections_key(kind);
        match self.entries.get_mut(&key) {
            Some(CacheValue::Sections(existing)) => existing.extend(sections),
            _ => self.set(key, CacheValue::Sections(sections)),
        }
    }

    /// `Some(text)` once a snapshot was taken for `kind`.
    pub fn snapshot(&self, kind: ConfigKind) -> Option<Option<&str>> {
        match self.get(&snapshot_key(kind)) {
            Some(CacheValue::Snapshot(text)) => Some(text.as_deref()),
            _ => None,
        }
    }

    pub fn allocation(&self) -> Option<&BTreeMap<String, Allocation>> {
        match self.get(keys::ALLOCATION) {
            Some(CacheValue::Allocation(a)) => Some(a),
            _ => None,
        }
    }

    pub fn volumes(&self) -> Option<&[VolumeMount]> {
        match self.get(keys::VOLUMES) {
            Some(CacheValue::Volumes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self.get(keys::API_TOKEN) {
            Some(CacheValue::Token(t)) => Some(t),
            _ => None,
        }
    }

    pub fn previous_token(&self) -> Option<&str> {
        match self.get(keys::PREVIOUS_TOKEN) {
            Some(CacheValue::Token(t)) => Some(t),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

// ── Update ────────────────────────────────────────────────────────────────────

pub struct Update {
    pub id: u64,
    pub tok: u64,
    pub descriptor: UpdateDescriptor,
    pub old: Option<Chute>,
    pub new: Option<Chute>,
    pub plans: PlanMap,
    pub cache: UpdateCache,
    pub progress: Vec<String>,
    pub result: Option<UpdateOutcome>,
    pub state: UpdateState,
    sink: ProgressSink,
    callback: Option<UpdateCallback>,
    ticket: Option<oneshot::Sender<UpdateOutcome>>,
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Update")
            .field("id", &self.id)
            .field("tok", &self.tok)
            .field("class", &self.descriptor.class)
            .field("type", &self.descriptor.kind)
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .finish()
    }
}

impl Update {
    pub fn new(
        id: u64,
        tok: u64,
        descriptor: UpdateDescriptor,
        sink: ProgressSink,
        callback: Option<UpdateCallback>,
        ticket: Option<oneshot::Sender<UpdateOutcome>>,
    ) -> Self {
        Self {
            id,
            tok,
            descriptor,
            old: None,
            new: None,
            plans: PlanMap::new(),
            cache: UpdateCache::default(),
            progress: Vec::new(),
            result: None,
            state: UpdateState::Queued,
            sink,
            callback,
            ticket,
        }
    }

    pub fn class(&self) -> UpdateClass {
        self.descriptor.class
    }

    pub fn kind(&self) -> UpdateType {
        self.descriptor.kind
    }

    pub fn name(&self) -> &str {
        self.descriptor.name.as_deref().unwrap_or("")
    }

    /// Owner tag for generated OS config sections.
    pub fn owner(&self) -> &str {
        match self.class() {
            UpdateClass::Chute => self.name(),
            _ => HOST_OWNER,
        }
    }

    /// Host-config and router updates manage the host's own sections.
    pub fn is_host_scope(&self) -> bool {
        matches!(self.class(), UpdateClass::HostConfig | UpdateClass::Router)
    }

    /// The chute that should exist once the update succeeds.
    pub fn desired(&self) -> Option<&Chute> {
        match self.kind() {
            UpdateType::Delete => None,
            _ => self.new.as_ref(),
        }
    }

    /// Key progress is reported under: the controller id when there is one.
    pub fn report_key(&self) -> String {
        self.descriptor
            .update_id
            .clone()
            .unwrap_or_else(|| format!("local-{}", self.id))
    }

    /// Snapshot `old` from the store and build `new` from the payload.
    ///
    /// Types that need an installed chute leave `new` empty when there is
    /// none; the state planner turns that into an abort.
    pub fn prepare(&mut self, store: &ChuteStore) -> Result<()> {
        if self.class() != UpdateClass::Chute {
            return Ok(());
        }
        let name = self.name().to_string();
        self.old = store.get(&name);

        let kind = self.kind();
        if kind != UpdateType::Create && self.old.is_none() {
            return Ok(());
        }

        let spec = self.descriptor.new.clone().unwrap_or_default();
        self.new = Some(match kind {
            UpdateType::Delete => match &self.old {
                Some(old) => old.clone(),
                None => return Ok(()),
            },
            UpdateType::Create | UpdateType::Update => {
                Chute::build(&name, spec, None, ChuteState::Running)?
            }
            UpdateType::Stop => Chute::build(&name, spec, self.old.as_ref(), ChuteState::Stopped)?,
            _ => Chute::build(&name, spec, self.old.as_ref(), ChuteState::Running)?,
        });
        Ok(())
    }

    pub fn progress(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(update = self.id, name = %self.name(), "{message}");
        self.sink.message(self.id, &self.report_key(), self.remote(), &message);
        self.progress.push(message);
    }

    pub fn set_state(&mut self, state: UpdateState) {
        self.state = state;
        self.sink.state(self.id, state);
    }

    fn remote(&self) -> bool {
        self.descriptor.update_id.is_some()
    }

    /// Record the result and notify the caller. A second call is an
    /// internal invariant violation and notifies nobody.
    pub fn complete(&mut self, success: bool, message: impl Into<String>) -> Result<UpdateOutcome> {
        if self.result.is_some() {
            return Err(PipelineError::Internal(format!(
                "update {} completed twice",
                self.id
            )));
        }
        let message = message.into();
        let state = if success {
            UpdateState::Succeeded
        } else if self.state == UpdateState::Executing {
            UpdateState::Failed
        } else {
            UpdateState::Aborted
        };
        self.set_state(state);

        let outcome = UpdateOutcome {
            id: self.id,
            tok: self.tok,
            state,
            success,
            message,
            progress: self.progress.clone(),
        };
        self.result = Some(outcome.clone());
        self.sink
            .complete(self.id, &self.report_key(), self.remote(), &outcome);

        if let Some(ticket) = self.ticket.take() {
            let _ = ticket.send(outcome.clone());
        }
        Ok(outcome)
    }

    /// Hand the caller's callback to the manager, which runs it isolated.
    pub fn take_callback(&mut self) -> Option<UpdateCallback> {
        self.callback.take()
    }

    /// Data directory handed to the chute's containers.
    pub fn data_dir(&self, root: &std::path::Path) -> PathBuf {
        root.join(self.name())
    }
}
