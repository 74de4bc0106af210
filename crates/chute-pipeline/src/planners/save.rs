use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::update::{Update, UpdateClass, UpdateType};

pub fn plan(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }
    let previous = update.old.clone().map(Box::new);

    match (update.class(), update.kind()) {
        (UpdateClass::Router, _) => {
            update.plans.add(
                priority::STATE_SAVE,
                Step::ClearStore,
                vec![Step::RestoreStore {
                    chutes: ctx.chutes.clone(),
                }],
            )?;
        }
        (UpdateClass::Chute, UpdateType::Delete) => {
            let name = update.name().to_string();
            update.plans.add(
                priority::STATE_SAVE,
                Step::DeleteChute { name: name.clone() },
                vec![Step::RestoreChute { name, previous }],
            )?;
        }
        (UpdateClass::Chute, _) => {
            if let Some(chute) = update.new.clone() {
                let name = chute.name.clone();
                update.plans.add(
                    priority::STATE_SAVE,
                    Step::SaveChute {
                        chute: Box::new(chute),
                    },
                    vec![Step::RestoreChute { name, previous }],
                )?;
            }
        }
        _ => {}
    }
    Ok(Verdict::Proceed)
}
