//! Plan map: the `(priority, do, undo)` entries planners contribute.
//!
//! Entries keep insertion order until `aggregate` stable-sorts them by
//! priority. Equal priorities therefore run in the order they were added.

use crate::error::{PipelineError, Result};
use crate::step::Step;

/// Global priority space. The relative order is a contract between planners;
/// gaps leave room for new steps without renumbering.
pub mod priority {
    // struct
    pub const STRUCT_GET_SYSTEM_DEVICES: u32 = 10;
    pub const STRUCT_GET_HOST_CONFIG: u32 = 11;
    pub const STRUCT_SET_HOST_CONFIG: u32 = 12;
    pub const STRUCT_GET_INT_NETWORK: u32 = 20;
    pub const STRUCT_SET_SYSTEM_CONFIG: u32 = 25;
    pub const STRUCT_SET_NETWORK: u32 = 30;

    // resource
    pub const RESOURCE_GET_ALLOCATION: u32 = 40;

    // traffic
    pub const TRAFFIC_GET_OS_FIREWALL: u32 = 50;
    pub const TRAFFIC_GET_DEVELOPER_FIREWALL: u32 = 52;
    pub const TRAFFIC_SET_FIREWALL: u32 = 60;

    // runtime
    pub const RUNTIME_GET_VIRT_PREAMBLE: u32 = 70;
    pub const RUNTIME_GET_VIRT_DHCP: u32 = 72;
    pub const RUNTIME_SET_VIRT_DHCP: u32 = 80;

    // wireless
    pub const WIRELESS_GET: u32 = 84;
    pub const WIRELESS_SET: u32 = 85;

    // state
    pub const STATE_PREPARE_IMAGE: u32 = 88;
    pub const STATE_CALL_STOP: u32 = 89;
    pub const STATE_CALL_START: u32 = 90;

    // config reload
    pub const CONFIG_UNLOAD: u32 = 93;
    pub const CONFIG_DIFF: u32 = 94;
    pub const CONFIG_RELOAD: u32 = 95;

    // services
    pub const SERVICES_CONFIGURE: u32 = 98;

    // save
    pub const STATE_SAVE: u32 = 100;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub priority: u32,
    pub step: Step,
    /// Run in order on rollback. Empty for pure-cache steps.
    pub undo: Vec<Step>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanMap {
    entries: Vec<PlanEntry>,
    aggregated: bool,
}

impl PlanMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, priority: u32, step: Step, undo: Vec<Step>) -> Result<()> {
        if self.aggregated {
            return Err(PipelineError::Internal(format!(
                "plan {step} added after aggregation"
            )));
        }
        self.entries.push(PlanEntry {
            priority,
            step,
            undo,
        });
        Ok(())
    }

    /// Order entries for execution. Calling it again changes nothing.
    pub fn aggregate(&mut self) -> &[PlanEntry] {
        if !self.aggregated {
            self.entries.sort_by_key(|e| e.priority);
            self.aggregated = true;
        }
        &self.entries
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregated
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn priorities(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.priority).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; used when planning aborts.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uci::ConfigKind;

    #[test]
    fn aggregate_is_stable_and_idempotent() {
        let mut plan = PlanMap::new();
        plan.add(95, Step::ReloadAll, Vec::new()).unwrap();
        plan.add(10, Step::GetSystemDevices, Vec::new()).unwrap();
        plan.add(
            30,
            Step::WriteConfig {
                kind: ConfigKind::Network,
            },
            vec![Step::RevertConfig {
                kind: ConfigKind::Network,
            }],
        )
        .unwrap();
        plan.add(10, Step::GetHostConfig, Vec::new()).unwrap();

        let first: Vec<Step> = plan.aggregate().iter().map(|e| e.step.clone()).collect();
        assert_eq!(
            first,
            vec![
                Step::GetSystemDevices,
                Step::GetHostConfig,
                Step::WriteConfig {
                    kind: ConfigKind::Network
                },
                Step::ReloadAll,
            ]
        );
        let second: Vec<Step> = plan.aggregate().iter().map(|e| e.step.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn add_after_aggregate_is_internal_error() {
        let mut plan = PlanMap::new();
        plan.aggregate();
        let err = plan.add(10, Step::GetSystemDevices, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InternalInvariant);
    }
}
