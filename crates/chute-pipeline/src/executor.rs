//! Executor: runs an aggregated plan map and rolls back on failure.
//!
//! Each successful do-step pushes its undo steps onto a stack. When a
//! do-step fails, forward progress stops and the stack is unwound in LIFO
//! order. A failing undo step is logged and the unwind carries on.

use crate::error::{PipelineError, Result};
use crate::plan::PlanEntry;
use crate::step::{Step, StepOutcome};
use crate::steps::{self, StepEnv};
use crate::update::Update;

/// Execute `update`'s plan. Aggregates the plan map if the caller did not.
///
/// On failure the returned error is the one that stopped forward progress,
/// after rollback has finished.
pub async fn execute(update: &mut Update, env: &StepEnv) -> Result<()> {
    let entries: Vec<PlanEntry> = update.plans.aggregate().to_vec();
    let mut undo_stack: Vec<Vec<Step>> = Vec::new();
    let mut replacement: Option<Step> = None;

    for entry in &entries {
        let step = match replacement.take() {
            Some(step) => {
                tracing::debug!(update = update.id, scheduled = %entry.step, replacement = %step, "step replaced");
                step
            }
            None => entry.step.clone(),
        };

        match run_step(&step, entry.priority, update, env).await {
            Ok(next) => replacement = next,
            Err(e) => return Err(fail(update, env, &step, e, undo_stack).await),
        }
        if !entry.undo.is_empty() {
            undo_stack.push(entry.undo.clone());
        }
    }

    // A replacement asked for by the last entry runs right away.
    let last = entries.last().map_or(0, |e| e.priority);
    while let Some(step) = replacement.take() {
        match run_step(&step, last, update, env).await {
            Ok(next) => replacement = next,
            Err(e) => return Err(fail(update, env, &step, e, undo_stack).await),
        }
    }
    Ok(())
}

async fn run_step(
    step: &Step,
    priority: u32,
    update: &mut Update,
    env: &StepEnv,
) -> Result<Option<Step>> {
    tracing::debug!(update = update.id, step = %step, priority, "running step");
    match steps::run(step, update, env).await? {
        StepOutcome::Done => Ok(None),
        StepOutcome::Replace(next) => Ok(Some(next)),
    }
}

async fn fail(
    update: &mut Update,
    env: &StepEnv,
    step: &Step,
    error: PipelineError,
    undo_stack: Vec<Vec<Step>>,
) -> PipelineError {
    tracing::warn!(update = update.id, step = %step, kind = %error.kind(), error = %error, "step failed");
    update.progress(format!("{} failed: {error}", step.name()));
    rollback(update, env, undo_stack).await;
    error
}

/// Unwind `undo_stack` newest first. Never stops early.
pub async fn rollback(update: &mut Update, env: &StepEnv, mut undo_stack: Vec<Vec<Step>>) {
    let mut failures = 0usize;
    while let Some(undo) = undo_stack.pop() {
        for step in undo {
            tracing::warn!(update = update.id, step = %step, "rolling back");
            if let Err(e) = steps::run(&step, update, env).await {
                failures += 1;
                tracing::warn!(update = update.id, step = %step, error = %e, "undo step failed");
                update.progress(format!("Rollback of {} failed: {e}", step.name()));
            }
        }
    }
    if failures == 0 {
        update.progress("Rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{env_with_mocks, update};
    use crate::uci::ConfigKind;
    use crate::update::{snapshot_key, CacheValue};

    #[tokio::test]
    async fn failure_unwinds_in_reverse() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        u.plans
            .add(
                10,
                Step::WriteConfig {
                    kind: ConfigKind::Network,
                },
                vec![
                    Step::RevertConfig {
                        kind: ConfigKind::Network,
                    },
                    Step::ReloadAll,
                ],
            )
            .unwrap();
        u.plans
            .add(
                20,
                Step::WriteConfig {
                    kind: ConfigKind::Dhcp,
                },
                vec![Step::RevertConfig {
                    kind: ConfigKind::Dhcp,
                }],
            )
            .unwrap();
        u.plans.add(30, Step::RemoveAllContainers, vec![]).unwrap();
        mocks.runtime.fail_on("list", "*");

        let err = execute(&mut u, &env).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
        assert!(!ConfigKind::Network.path(&env.settings.os_config_dir).exists());
        assert!(!ConfigKind::Dhcp.path(&env.settings.os_config_dir).exists());
        assert_eq!(mocks.confd.count("reload_all"), 1);
        assert!(u.progress.iter().any(|p| p.starts_with("container.remove_all failed")));
    }

    #[tokio::test]
    async fn undo_failures_do_not_stop_rollback() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        u.plans
            .add(10, Step::ComputeResources, vec![Step::ReloadAll, Step::WaitSystemUp])
            .unwrap();
        u.plans.add(20, Step::RemoveAllContainers, vec![]).unwrap();
        mocks.confd.fail_on("reload_all");
        mocks.runtime.fail_on("list", "*");

        assert!(execute(&mut u, &env).await.is_err());
        assert_eq!(mocks.confd.count("wait_system_up"), 1);
        assert!(u.progress.iter().any(|p| p.starts_with("Rollback of reload.reload_all failed")));
    }

    #[tokio::test]
    async fn replacement_runs_instead_of_next_step() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        u.cache.set(snapshot_key(ConfigKind::Network), CacheValue::Snapshot(None));
        u.plans.add(94, Step::DiffConfig, vec![]).unwrap();
        u.plans.add(95, Step::ReloadAll, vec![]).unwrap();

        execute(&mut u, &env).await.unwrap();
        assert_eq!(mocks.confd.calls(), vec!["wait_system_up"]);
    }

    #[tokio::test]
    async fn trailing_replacement_runs_immediately() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        u.plans.add(94, Step::DiffConfig, vec![]).unwrap();

        execute(&mut u, &env).await.unwrap();
        assert_eq!(mocks.confd.calls(), vec!["wait_system_up"]);
    }
}
