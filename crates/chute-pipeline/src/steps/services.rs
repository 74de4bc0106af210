//! Side service steps: zerotier, telemetry settings and telemetry targets.

use chute_core::hostconfig::{TelemetryConfig, ZerotierConfig};

use super::StepEnv;
use crate::error::{with_deadline, Result};
use crate::step::StepOutcome;
use crate::update::Update;

async fn configure(
    env: &StepEnv,
    zerotier: &ZerotierConfig,
    telemetry: &TelemetryConfig,
) -> Result<()> {
    let timeout = env.settings.runtime_timeout;
    with_deadline("services.zerotier", timeout, env.services.apply_zerotier(zerotier)).await?;
    with_deadline("services.telemetry", timeout, env.services.apply_telemetry(telemetry)).await
}

/// Apply the side services of the host config this update settled on.
pub async fn apply(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let host = update.cache.host_config().cloned().unwrap_or_default();
    configure(env, &host.zerotier, &host.telemetry).await?;
    update.progress(format!(
        "Configured side services (zerotier {}, telemetry {})",
        if host.zerotier.enabled { "on" } else { "off" },
        if host.telemetry.enabled { "on" } else { "off" },
    ));
    Ok(StepOutcome::Done)
}

pub async fn restore(
    env: &StepEnv,
    zerotier: &ZerotierConfig,
    telemetry: &TelemetryConfig,
) -> Result<StepOutcome> {
    configure(env, zerotier, telemetry).await?;
    tracing::warn!("side services restored");
    Ok(StepOutcome::Done)
}

pub async fn set_targets(env: &StepEnv, containers: &[String]) -> Result<StepOutcome> {
    with_deadline(
        "services.telemetry_targets",
        env.settings.runtime_timeout,
        env.services.set_telemetry_targets(containers),
    )
    .await?;
    tracing::debug!(targets = ?containers, "telemetry targets");
    Ok(StepOutcome::Done)
}
