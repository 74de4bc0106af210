use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::uci::ConfigKind;
use crate::update::{Update, UpdateClass};

pub fn plan(update: &mut Update, _ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }
    if update.class() == UpdateClass::Chute {
        update
            .plans
            .add(priority::RUNTIME_GET_VIRT_PREAMBLE, Step::GetVirtPreamble, vec![])?;
    }
    update
        .plans
        .add(priority::RUNTIME_GET_VIRT_DHCP, Step::GetVirtDhcp, vec![])?;
    update.plans.add(
        priority::RUNTIME_SET_VIRT_DHCP,
        Step::WriteConfig {
            kind: ConfigKind::Dhcp,
        },
        vec![Step::RevertConfig {
            kind: ConfigKind::Dhcp,
        }],
    )?;
    Ok(Verdict::Proceed)
}
