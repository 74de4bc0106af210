//! Planners: pure functions that inspect an update and schedule steps.
//!
//! Planners run in a fixed order. Each may add steps to the plan map or
//! abort the update; none of them touches the outside world. Whatever they
//! need beyond the update itself is gathered up front into a `PlanContext`.

mod name;
mod reload;
mod resource;
mod runtime;
mod save;
mod services;
mod state;
mod structure;
mod traffic;
mod wireless;

use std::collections::BTreeMap;

use chute_core::{Chute, HostConfig};

use crate::error::{ErrorKind, Result};
use crate::update::{Update, UpdateClass};

/// Read-only view of the node taken when planning starts.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub chutes: Vec<Chute>,
    /// Current host config, or the default when none is on disk yet.
    pub host_config: HostConfig,
    /// Installed package versions; only gathered for snap updates.
    pub installed_snaps: BTreeMap<String, String>,
}

impl PlanContext {
    pub fn chute(&self, name: &str) -> Option<&Chute> {
        self.chutes.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Abort(String),
}

pub type Planner = fn(&mut Update, &PlanContext) -> Result<Verdict>;

/// Every planner, in the order they run.
pub const PLANNERS: &[(&str, Planner)] = &[
    ("name", name::plan),
    ("struct", structure::plan),
    ("resource", resource::plan),
    ("traffic", traffic::plan),
    ("runtime", runtime::plan),
    ("wireless", wireless::plan),
    ("state", state::plan),
    ("reload", reload::plan),
    ("services", services::plan),
    ("save", save::plan),
];

/// Run every planner. A planner error counts as an abort unless it is an
/// internal invariant violation, which is returned as is.
///
/// The plan map is emptied when the update aborts.
pub fn plan(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    for (name, planner) in PLANNERS {
        let verdict = match planner(update, ctx) {
            Ok(verdict) => verdict,
            Err(e) if e.kind() == ErrorKind::InternalInvariant => return Err(e),
            Err(e) => Verdict::Abort(e.to_string()),
        };
        if let Verdict::Abort(reason) = verdict {
            tracing::info!(update = update.id, planner = %name, reason = %reason, "update aborted");
            update.plans.clear();
            return Ok(Verdict::Abort(reason));
        }
    }
    Ok(Verdict::Proceed)
}

/// Planners other than `name` and `state` have nothing to do for package
/// installs, or for chute updates without a chute to act on.
fn nothing_to_plan(update: &Update) -> bool {
    match update.class() {
        UpdateClass::Snap => true,
        UpdateClass::Chute => update.new.is_none(),
        _ => false,
    }
}

/// Container names telemetry should watch once `update` succeeds.
fn telemetry_targets(update: &Update, ctx: &PlanContext) -> Vec<String> {
    let mut targets: Vec<String> = ctx
        .chutes
        .iter()
        .filter(|c| c.is_running() && c.name != update.name())
        .flat_map(Chute::container_names)
        .collect();
    if let Some(chute) = update.desired().filter(|c| c.is_running()) {
        targets.extend(chute.container_names());
    }
    targets.sort();
    targets
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::reporter::ProgressSink;
    use crate::store::ChuteStore;
    use crate::update::UpdateDescriptor;
    use chute_core::{ChuteSpec, ChuteState};

    pub fn chute(name: &str, version: u64, state: ChuteState) -> Chute {
        let spec: ChuteSpec = serde_json::from_value(serde_json::json!({
            "version": version,
            "services": {"main": {"image": "python2", "command": "python -u main.py"}}
        }))
        .unwrap();
        Chute::build(name, spec, None, state).unwrap()
    }

    /// Build and prepare an update against a store holding `installed`.
    pub fn prepared(descriptor: serde_json::Value, installed: &[Chute]) -> (Update, PlanContext) {
        let id = std::process::id();
        let path = std::env::temp_dir().join(format!(
            "chute-planner-test-{id}-{}.yaml",
            rand::random::<u64>()
        ));
        let store = ChuteStore::open(&path).unwrap();
        store.replace_all(installed.to_vec()).unwrap();

        let descriptor: UpdateDescriptor = serde_json::from_value(descriptor).unwrap();
        let mut update = Update::new(1, 1, descriptor, ProgressSink::default(), None, None);
        update.prepare(&store).unwrap();
        let _ = std::fs::remove_file(&path);

        let ctx = PlanContext {
            chutes: installed.to_vec(),
            ..Default::default()
        };
        (update, ctx)
    }
}
