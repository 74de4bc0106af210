//! Configuration daemon reload steps.

use chute_core::fs::read_optional;

use super::StepEnv;
use crate::confd::SectionStatus;
use crate::error::{PipelineError, Result};
use crate::step::{Step, StepOutcome};
use crate::uci::{ConfigFile, ConfigKind};
use crate::update::Update;

/// Narrow the scheduled reload to what this update changed.
///
/// Returns `WaitSystemUp` when no written file differs from its snapshot,
/// and a reload of the update's owner when only the owner's sections
/// differ. Otherwise the full reload runs.
pub fn diff(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let owner = update.owner().to_string();
    let mut changed = Vec::new();
    let mut foreign = false;
    for kind in ConfigKind::ALL {
        let Some(before) = update.cache.snapshot(kind) else {
            continue;
        };
        let path = kind.path(&env.settings.os_config_dir);
        let now = read_optional(&path)
            .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
        if now.as_deref() != before {
            changed.push(kind);
            foreign |= !only_owner_differs(before, now.as_deref(), &owner);
        }
    }

    if changed.is_empty() {
        tracing::debug!(update = update.id, "config unchanged, skipping reload");
        return Ok(StepOutcome::Replace(Step::WaitSystemUp));
    }
    tracing::debug!(update = update.id, changed = ?changed, foreign, "config changed");
    if foreign {
        return Ok(StepOutcome::Done);
    }
    Ok(StepOutcome::Replace(Step::Reload { owner }))
}

/// True when the two texts agree on every section not owned by `owner`.
/// Text that does not parse counts as a foreign change.
fn only_owner_differs(before: Option<&str>, now: Option<&str>, owner: &str) -> bool {
    let others = |text: Option<&str>| {
        ConfigFile::parse(text.unwrap_or("")).map(|file| {
            file.sections
                .into_iter()
                .filter(|s| s.owner.as_deref() != Some(owner))
                .collect::<Vec<_>>()
        })
    };
    match (others(before), others(now)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Split statuses into fatal failures for `owner` and warnings.
pub fn classify<'a>(
    statuses: &'a [SectionStatus],
    owner: &str,
) -> (Vec<&'a SectionStatus>, Vec<&'a SectionStatus>) {
    statuses
        .iter()
        .filter(|s| !s.success)
        .partition(|s| s.is_fatal_for(owner))
}

pub async fn reload_all(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let statuses = env
        .confd_call("confd.reload_all", env.confd.reload_all())
        .await?;
    check(update, &statuses)?;
    update.progress("Reloaded system configuration");
    Ok(StepOutcome::Done)
}

/// Reload only the sections `owner` generated.
pub async fn reload(update: &mut Update, env: &StepEnv, owner: &str) -> Result<StepOutcome> {
    let statuses = env
        .confd_call("confd.reload", env.confd.reload(owner))
        .await?;
    check(update, &statuses)?;
    update.progress(format!("Reloaded configuration of {owner}"));
    Ok(StepOutcome::Done)
}

/// Tear down every generated section ahead of a full reload.
pub async fn unload_all(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    env.confd_call("confd.unload_all", env.confd.unload_all())
        .await?;
    update.progress("Unloaded system configuration");
    Ok(StepOutcome::Done)
}

/// Report foreign and stale failures as warnings; fail on the update's own.
fn check(update: &mut Update, statuses: &[SectionStatus]) -> Result<()> {
    let owner = update.owner().to_string();
    let (fatal, warnings) = classify(statuses, &owner);

    for status in &warnings {
        tracing::warn!(owner = %owner, section = %status, "config section failed");
        update.progress(format!("Warning: {status}"));
    }
    if !fatal.is_empty() {
        let list: Vec<String> = fatal.iter().map(|s| s.to_string()).collect();
        return Err(PipelineError::ConfigReload(list.join("; ")));
    }
    Ok(())
}

pub async fn wait_system_up(env: &StepEnv) -> Result<StepOutcome> {
    env.confd_call("confd.wait_system_up", env.confd.wait_system_up())
        .await?;
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{env_with_mocks, update};
    use crate::update::{snapshot_key, CacheValue};

    fn status(comment: &str, success: bool, age: u64) -> SectionStatus {
        SectionStatus {
            kind: "interface".into(),
            name: format!("{comment}_lan"),
            comment: Some(comment.into()),
            success,
            age,
        }
    }

    #[test]
    fn diff_replaces_reload_when_nothing_changed() {
        let (env, _mocks, _dir) = env_with_mocks();
        let path = ConfigKind::Network.path(&env.settings.os_config_dir);
        std::fs::write(&path, "same\n").unwrap();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        u.cache.set(
            snapshot_key(ConfigKind::Network),
            CacheValue::Snapshot(Some("same\n".into())),
        );
        assert_eq!(
            diff(&mut u, &env).unwrap(),
            StepOutcome::Replace(Step::WaitSystemUp)
        );

        std::fs::write(&path, "different\n").unwrap();
        assert_eq!(diff(&mut u, &env).unwrap(), StepOutcome::Done);
    }

    #[test]
    fn diff_narrows_reload_to_owner() {
        let (env, _mocks, _dir) = env_with_mocks();
        let path = ConfigKind::Network.path(&env.settings.os_config_dir);
        let host = "config interface 'lan' # __hostconfig__\n\toption proto 'static'\n";
        let mut u = update(serde_json::json!({"class": "chute", "type": "create", "name": "cam"}));
        u.cache.set(
            snapshot_key(ConfigKind::Network),
            CacheValue::Snapshot(Some(host.into())),
        );

        std::fs::write(
            &path,
            format!("{host}\nconfig interface 'cam_lan' # cam\n\toption proto 'static'\n"),
        )
        .unwrap();
        assert_eq!(
            diff(&mut u, &env).unwrap(),
            StepOutcome::Replace(Step::Reload {
                owner: "cam".into()
            })
        );

        std::fs::write(
            &path,
            "config interface 'lan' # __hostconfig__\n\toption proto 'dhcp'\n",
        )
        .unwrap();
        assert_eq!(diff(&mut u, &env).unwrap(), StepOutcome::Done);
    }

    #[tokio::test]
    async fn owner_reload_checks_statuses() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        mocks.confd.set_statuses(vec![status("cam", false, 0)]);
        let err = reload(&mut u, &env, "cam").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigReloadFailure);
        assert_eq!(mocks.confd.calls(), vec!["reload cam"]);
    }

    #[test]
    fn classify_splits_owned_fresh_failures() {
        let statuses = vec![
            status("cam", false, 0),
            status("cam", false, 3),
            status("other", false, 0),
            status("cam", true, 0),
        ];
        let (fatal, warnings) = classify(&statuses, "cam");
        assert_eq!(fatal.len(), 1);
        assert_eq!(warnings.len(), 2);
    }

    #[tokio::test]
    async fn fatal_status_fails_reload() {
        let (env, mocks, _dir) = env_with_mocks();
        let mut u = update(serde_json::json!({"class": "chute", "type": "restart", "name": "cam"}));
        mocks.confd.set_statuses(vec![status("other", false, 0)]);
        reload_all(&mut u, &env).await.unwrap();
        assert!(u.progress.iter().any(|p| p.starts_with("Warning")));

        mocks.confd.set_statuses(vec![status("cam", false, 0)]);
        let err = reload_all(&mut u, &env).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigReloadFailure);
        assert_eq!(mocks.confd.count("reload_all"), 2);
    }
}
