//! Devices, host config and the internal network layout.

use chute_core::HostConfig;

use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::patch;
use crate::plan::priority;
use crate::step::Step;
use crate::uci::ConfigKind;
use crate::update::{Update, UpdateClass};

pub fn plan(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }

    update
        .plans
        .add(priority::STRUCT_GET_SYSTEM_DEVICES, Step::GetSystemDevices, vec![])?;
    update
        .plans
        .add(priority::STRUCT_GET_HOST_CONFIG, Step::GetHostConfig, vec![])?;

    let factory_reset = update.class() == UpdateClass::Router;
    match update.class() {
        UpdateClass::HostConfig => {
            let ops = update.descriptor.patch.clone().unwrap_or_default();
            let patched = match patch::apply(&ctx.host_config.to_json(), &ops) {
                Ok(value) => value,
                Err(e) => return Ok(Verdict::Abort(e.to_string())),
            };
            let config = match HostConfig::from_json(patched) {
                Ok(config) => config,
                Err(e) => return Ok(Verdict::Abort(e.to_string())),
            };
            update.plans.add(
                priority::STRUCT_SET_HOST_CONFIG,
                Step::SetHostConfig {
                    config: Box::new(config),
                },
                vec![Step::RestoreHostConfig],
            )?;
        }
        UpdateClass::Router => {
            update.plans.add(
                priority::STRUCT_SET_HOST_CONFIG,
                Step::ResetHostConfig,
                vec![Step::RestoreHostConfig],
            )?;
            let mut undo: Vec<Step> = ConfigKind::ALL
                .into_iter()
                .map(|kind| Step::RevertConfig { kind })
                .collect();
            undo.push(Step::ReloadAll);
            update
                .plans
                .add(priority::STRUCT_SET_SYSTEM_CONFIG, Step::ClearChuteConfig, undo)?;
        }
        _ => {}
    }

    update
        .plans
        .add(priority::STRUCT_GET_INT_NETWORK, Step::ComputeNetwork, vec![])?;

    // The first file written carries the reload, so rollback reloads only
    // after every later file has been reverted.
    let mut undo = vec![Step::RevertConfig {
        kind: ConfigKind::Network,
    }];
    if !factory_reset {
        undo.push(Step::ReloadAll);
    }
    update.plans.add(
        priority::STRUCT_SET_NETWORK,
        Step::WriteConfig {
            kind: ConfigKind::Network,
        },
        undo,
    )?;
    Ok(Verdict::Proceed)
}
