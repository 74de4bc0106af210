use super::{nothing_to_plan, telemetry_targets, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::update::{Update, UpdateClass};

pub fn plan(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }

    if update.is_host_scope() {
        update.plans.add(
            priority::SERVICES_CONFIGURE,
            Step::ApplyHostServices,
            vec![Step::RestoreHostServices {
                zerotier: ctx.host_config.zerotier.clone(),
                telemetry: ctx.host_config.telemetry.clone(),
            }],
        )?;
        if update.class() == UpdateClass::HostConfig {
            return Ok(Verdict::Proceed);
        }
    }

    let previous: Vec<String> = {
        let mut names: Vec<String> = ctx
            .chutes
            .iter()
            .filter(|c| c.is_running())
            .flat_map(|c| c.container_names())
            .collect();
        names.sort();
        names
    };
    let containers = if update.class() == UpdateClass::Router {
        Vec::new()
    } else {
        telemetry_targets(update, ctx)
    };
    update.plans.add(
        priority::SERVICES_CONFIGURE,
        Step::SetTelemetryTargets { containers },
        vec![Step::SetTelemetryTargets {
            containers: previous,
        }],
    )?;
    Ok(Verdict::Proceed)
}
