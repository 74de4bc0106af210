use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::uci::ConfigKind;
use crate::update::Update;

pub fn plan(update: &mut Update, _ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }
    update
        .plans
        .add(priority::WIRELESS_GET, Step::GetWireless, vec![])?;
    update.plans.add(
        priority::WIRELESS_SET,
        Step::WriteConfig {
            kind: ConfigKind::Wireless,
        },
        vec![Step::RevertConfig {
            kind: ConfigKind::Wireless,
        }],
    )?;
    Ok(Verdict::Proceed)
}
