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
    update
        .plans
        .add(priority::TRAFFIC_GET_OS_FIREWALL, Step::GetOsFirewall, vec![])?;
    if update.class() == UpdateClass::Chute {
        update.plans.add(
            priority::TRAFFIC_GET_DEVELOPER_FIREWALL,
            Step::GetDeveloperFirewall,
            vec![],
        )?;
    }
    update.plans.add(
        priority::TRAFFIC_SET_FIREWALL,
        Step::WriteConfig {
            kind: ConfigKind::Firewall,
        },
        vec![Step::RevertConfig {
            kind: ConfigKind::Firewall,
        }],
    )?;
    Ok(Verdict::Proceed)
}
