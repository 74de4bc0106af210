//! Lifecycle transitions and their legality.
//!
//! Illegal transitions abort here, before any step has run: acting on a
//! missing chute, creating one twice, stopping a stopped chute, updating to
//! a version that is not newer, and installing a package that is not newer
//! than the installed one.

use semver::Version;

use super::{PlanContext, Verdict};
use crate::error::Result;
use crate::installer::InstallMessage;
use crate::plan::priority;
use crate::step::{PreambleSource, Step};
use crate::update::{Update, UpdateClass, UpdateType};

pub fn plan(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    match update.class() {
        UpdateClass::Chute => plan_chute(update),
        UpdateClass::Router => {
            update
                .plans
                .add(priority::STATE_CALL_START, Step::RemoveAllContainers, vec![])?;
            Ok(Verdict::Proceed)
        }
        UpdateClass::Snap => plan_install(update, ctx),
        UpdateClass::HostConfig => Ok(Verdict::Proceed),
    }
}

fn plan_chute(update: &mut Update) -> Result<Verdict> {
    let name = update.name().to_string();
    let kind = update.kind();

    let old = update.old.clone().map(Box::new);
    if kind == UpdateType::Create {
        if old.is_some() {
            return Ok(Verdict::Abort(format!("Chute {name} already exists")));
        }
    } else if old.is_none() {
        return Ok(Verdict::Abort(format!("No chute found with id: {name}")));
    }
    let Some(new) = update.new.clone().map(Box::new) else {
        return Ok(Verdict::Abort(format!("No chute found with id: {name}")));
    };

    let plans = &mut update.plans;
    match (kind, old) {
        (UpdateType::Create, _) => {
            plans.add(
                priority::STATE_PREPARE_IMAGE,
                Step::PrepareImages { chute: new.clone() },
                vec![Step::RemoveImages { chute: new.clone() }],
            )?;
            plans.add(
                priority::STATE_CALL_START,
                Step::CreateContainers {
                    chute: new.clone(),
                    start: true,
                    preamble: PreambleSource::Planned,
                },
                vec![
                    Step::StopContainers { chute: new.clone() },
                    Step::RemoveContainers { chute: new },
                ],
            )?;
        }
        (UpdateType::Start, Some(old)) => {
            plans.add(
                priority::STATE_CALL_START,
                Step::StartContainers { chute: new },
                vec![Step::StopContainers { chute: old }],
            )?;
        }
        (UpdateType::Stop, Some(old)) => {
            if !old.is_running() {
                return Ok(Verdict::Abort(format!("Chute {name} is already stopped")));
            }
            plans.add(
                priority::STATE_CALL_STOP,
                Step::StopContainers { chute: new },
                vec![Step::StartContainers { chute: old }],
            )?;
        }
        (UpdateType::Restart, Some(_)) => {
            plans.add(
                priority::STATE_CALL_START,
                Step::RestartContainers { chute: new },
                vec![],
            )?;
        }
        (UpdateType::Delete, Some(old)) => {
            let restart = if old.is_running() {
                vec![Step::StartContainers { chute: old.clone() }]
            } else {
                vec![]
            };
            plans.add(
                priority::STATE_CALL_STOP,
                Step::StopContainers { chute: old.clone() },
                restart,
            )?;
            plans.add(
                priority::STATE_CALL_START,
                Step::RemoveContainers { chute: old.clone() },
                vec![Step::CreateContainers {
                    chute: old.clone(),
                    start: false,
                    preamble: PreambleSource::Previous,
                }],
            )?;
            plans.add(
                priority::STATE_CALL_START,
                Step::RemoveImages { chute: old.clone() },
                vec![Step::PrepareImages { chute: old }],
            )?;
        }
        (UpdateType::Update, Some(old)) => {
            if new.version <= old.version {
                return Ok(Verdict::Abort(format!(
                    "Chute {name} version {} is not newer than installed version {}",
                    new.version, old.version
                )));
            }
            let restart = if old.is_running() {
                vec![Step::StartContainers { chute: old.clone() }]
            } else {
                vec![]
            };
            plans.add(
                priority::STATE_PREPARE_IMAGE,
                Step::PrepareImages { chute: new.clone() },
                vec![Step::RemoveImages { chute: new.clone() }],
            )?;
            plans.add(
                priority::STATE_CALL_STOP,
                Step::StopContainers { chute: old.clone() },
                restart,
            )?;
            plans.add(
                priority::STATE_CALL_START,
                Step::RemoveContainers { chute: old.clone() },
                vec![Step::CreateContainers {
                    chute: old,
                    start: false,
                    preamble: PreambleSource::Previous,
                }],
            )?;
            let start = new.is_running();
            plans.add(
                priority::STATE_CALL_START,
                Step::CreateContainers {
                    chute: new.clone(),
                    start,
                    preamble: PreambleSource::Planned,
                },
                vec![
                    Step::StopContainers { chute: new.clone() },
                    Step::RemoveContainers { chute: new },
                ],
            )?;
        }
        _ => {}
    }
    Ok(Verdict::Proceed)
}

fn plan_install(update: &mut Update, ctx: &PlanContext) -> Result<Verdict> {
    for source in &update.descriptor.sources {
        let wanted = match Version::parse(&source.version) {
            Ok(v) => v,
            Err(e) => {
                return Ok(Verdict::Abort(format!(
                    "Invalid version {} for {}: {e}",
                    source.version, source.name
                )))
            }
        };
        let Some(installed) = ctx.installed_snaps.get(&source.name) else {
            continue;
        };
        // Unparseable installed versions do not block an install.
        let Ok(current) = Version::parse(installed) else {
            tracing::warn!(snap = %source.name, version = %installed, "installed version is not semver");
            continue;
        };
        if wanted <= current {
            return Ok(Verdict::Abort(format!(
                "Refusing to install {} {wanted}: version {current} is installed",
                source.name
            )));
        }
    }

    let message = InstallMessage {
        command: "install".to_string(),
        sources: update.descriptor.sources.clone(),
        external: update.descriptor.external.clone(),
    };
    update
        .plans
        .add(priority::STATE_CALL_START, Step::InstallSnaps { message }, vec![])?;
    Ok(Verdict::Proceed)
}
