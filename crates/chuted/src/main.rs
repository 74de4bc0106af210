//! chuted: chute update daemon.
//!
//! Wires the pipeline to the real node: container engine CLI, the OS
//! config daemon, the installer, the controller and the side services.
//! `--dry-run` swaps every external collaborator for the in-process mocks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chute_core::{ChutedConfig, HostConfig};
use chute_pipeline::{
    reporter, ChuteStore, CommandHostServices, ConfdClient, ContainerRuntime, ControllerClient,
    DockerCli, HostServices, HttpController, InstallerClient, MockConfd, MockHostServices,
    MockInstaller, MockRuntime, PipelineSettings, ReporterSettings, SocketConfd, SocketInstaller,
    StepEnv, UpdateClass, UpdateDescriptor, UpdateManager, UpdateType,
};

mod intake;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match ChutedConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = ChutedConfig::load().context("failed to load config")?;

    let dry_run = std::env::args().any(|a| a == "--dry-run");
    tracing::info!(dry_run, "chuted starting");

    let settings = PipelineSettings::from_config(&config).context("invalid pipeline settings")?;
    std::fs::create_dir_all(&settings.os_config_dir).with_context(|| {
        format!("failed to create {}", settings.os_config_dir.display())
    })?;
    let store = ChuteStore::open(&config.paths.chute_store).context("failed to open chute store")?;

    // ── Clients ──────────────────────────────────────────────────────────────
    let (runtime, confd, installer, services): (
        Arc<dyn ContainerRuntime>,
        Arc<dyn ConfdClient>,
        Arc<dyn InstallerClient>,
        Arc<dyn HostServices>,
    ) = if dry_run {
        (
            Arc::new(MockRuntime::new()),
            Arc::new(MockConfd::new()),
            Arc::new(MockInstaller::new()),
            Arc::new(MockHostServices::new()),
        )
    } else {
        (
            Arc::new(DockerCli::new(
                &config.runtime.binary,
                std::env::temp_dir().join("chuted-build"),
            )),
            Arc::new(SocketConfd::new(&config.confd.socket)),
            Arc::new(SocketInstaller::new(&config.installer.socket)),
            Arc::new(CommandHostServices {
                zerotier_cli: config.services.zerotier_cli.clone(),
                telemetry_settings: config.services.telemetry_settings.clone(),
                telemetry_targets: config.services.telemetry_targets.clone(),
            }),
        )
    };

    let remote = !config.controller.url.is_empty() && !dry_run;
    let controller: Option<Arc<dyn ControllerClient>> = if !remote {
        tracing::info!("no controller configured, progress stays local");
        None
    } else {
        let client = HttpController::new(
            &config.controller.url,
            &config.controller.router_id,
            config.controller.token.clone(),
            Duration::from_secs(10),
        )
        .context("failed to build controller client")?;
        tracing::info!(url = %config.controller.url, router = %config.controller.router_id, "controller client ready");
        Some(Arc::new(client))
    };

    // The OS config daemon must be up before anything is written for it.
    tokio::time::timeout(settings.confd_timeout, confd.wait_system_up())
        .await
        .context("timed out waiting for the config daemon")?
        .context("config daemon is not ready")?;

    let first_boot = HostConfig::load_optional(&settings.host_config)
        .context("failed to read host config")?
        .is_none();

    let env = StepEnv {
        settings: Arc::new(settings),
        store,
        runtime,
        confd,
        installer,
        services,
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let (reporter, reporter_task) = reporter::spawn(
        ReporterSettings::from_config(&config.reporter),
        controller,
        shutdown_tx.subscribe(),
    );
    let (manager, manager_task) = UpdateManager::spawn(
        env,
        config.manager.queue_capacity,
        Some(reporter),
        shutdown_tx.subscribe(),
    );

    if first_boot {
        // An empty patch generates and applies the default host config.
        let mut descriptor =
            UpdateDescriptor::new(UpdateClass::HostConfig, UpdateType::PatchHostConfig);
        descriptor.patch = Some(Vec::new());
        match manager.add(descriptor, None) {
            Ok(ticket) => {
                tracing::info!(update = ticket.id, "first boot, applying default host config")
            }
            Err(e) => tracing::error!(error = %e, "failed to queue default host config"),
        }
    }

    let listener = intake::bind(&config.intake.socket)?;
    let intake_task = tokio::spawn(intake::serve(
        listener,
        manager.clone(),
        shutdown_tx.subscribe(),
    ));

    tracing::info!(socket = %config.intake.socket.display(), "chuted running");

    let mut shutdown = shutdown_tx.subscribe();
    let _ = shutdown.recv().await;

    drop(manager);
    let _ = manager_task.await;
    let _ = reporter_task.await;
    let _ = intake_task.await;
    let _ = std::fs::remove_file(&config.intake.socket);

    tracing::info!("chuted stopped");
    Ok(())
}
