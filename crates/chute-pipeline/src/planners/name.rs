use super::{PlanContext, Verdict};
use crate::error::Result;
use crate::update::Update;

/// Surface the warnings recorded when the installed and desired chutes were built.
pub fn plan(update: &mut Update, _ctx: &PlanContext) -> Result<Verdict> {
    let mut warnings: Vec<String> = Vec::new();
    for chute in [update.old.as_ref(), update.new.as_ref()].into_iter().flatten() {
        for warning in &chute.warnings {
            if !warnings.contains(warning) {
                warnings.push(warning.clone());
            }
        }
    }
    for warning in warnings {
        update.progress(format!("Warning: {warning}"));
    }
    Ok(Verdict::Proceed)
}
