//! Step library: the do/undo actions planners schedule.
//!
//! Generator steps only fill the update cache. Writer and runtime steps
//! touch the outside world and are always scheduled with an undo.

pub mod container;
pub mod devices;
pub mod firewall;
pub mod hostconfig;
pub mod network;
pub mod osconfig;
pub mod reload;
pub mod resources;
pub mod runtime;
pub mod save;
pub mod services;
pub mod wireless;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chute_core::ChutedConfig;
use ipnetwork::Ipv4Network;

use crate::confd::ConfdClient;
use crate::error::{with_deadline, PipelineError, Result};
use crate::host_services::HostServices;
use crate::installer::InstallerClient;
use crate::runtime::ContainerRuntime;
use crate::step::{Step, StepOutcome};
use crate::store::ChuteStore;
use crate::update::Update;

/// Paths and limits the steps need, resolved from the daemon config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub host_config: PathBuf,
    pub os_config_dir: PathBuf,
    pub sysfs_root: PathBuf,
    pub chute_data_dir: PathBuf,
    pub subnet_pool: Ipv4Network,
    pub chute_prefix: u8,
    pub default_memory: Option<u64>,
    pub runtime_timeout: Duration,
    pub confd_timeout: Duration,
    pub installer_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &ChutedConfig) -> Result<Self> {
        let subnet_pool: Ipv4Network = config.network.chute_subnet_pool.parse().map_err(|e| {
            PipelineError::Validation(format!(
                "chute subnet pool {:?}: {e}",
                config.network.chute_subnet_pool
            ))
        })?;
        if config.network.chute_prefix < subnet_pool.prefix() || config.network.chute_prefix > 30 {
            return Err(PipelineError::Validation(format!(
                "chute prefix /{} does not fit pool {subnet_pool}",
                config.network.chute_prefix
            )));
        }
        Ok(Self {
            host_config: config.paths.host_config.clone(),
            os_config_dir: config.paths.os_config_dir.clone(),
            sysfs_root: config.paths.sysfs_root.clone(),
            chute_data_dir: config.paths.chute_data_dir.clone(),
            subnet_pool,
            chute_prefix: config.network.chute_prefix,
            default_memory: match config.resources.default_memory_bytes {
                0 => None,
                bytes => Some(bytes),
            },
            runtime_timeout: Duration::from_secs(config.runtime.timeout_secs),
            confd_timeout: Duration::from_secs(config.confd.timeout_secs),
            installer_timeout: Duration::from_secs(config.installer.timeout_secs),
        })
    }
}

/// Everything a step may touch.
#[derive(Clone)]
pub struct StepEnv {
    pub settings: Arc<PipelineSettings>,
    pub store: ChuteStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub confd: Arc<dyn ConfdClient>,
    pub installer: Arc<dyn InstallerClient>,
    pub services: Arc<dyn HostServices>,
}

impl StepEnv {
    /// Run a container runtime call under the runtime deadline.
    pub(crate) async fn runtime_call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = crate::runtime::Result<T>>,
    {
        with_deadline(what, self.settings.runtime_timeout, async {
            fut.await.map_err(PipelineError::from)
        })
        .await
    }

    pub(crate) async fn confd_call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = crate::confd::Result<T>>,
    {
        with_deadline(what, self.settings.confd_timeout, async {
            fut.await.map_err(PipelineError::from)
        })
        .await
    }
}

/// Run one step against `update`.
pub async fn run(step: &Step, update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    use crate::step::Step::*;

    match step {
        GetSystemDevices => devices::get_system_devices(update, env),
        GetHostConfig => hostconfig::get(update, env),
        SetHostConfig { config } => hostconfig::set(update, env, config),
        ResetHostConfig => hostconfig::reset(update, env),
        RestoreHostConfig => hostconfig::restore(update, env),

        ComputeNetwork => network::compute(update, env),
        WriteConfig { kind } => osconfig::write(update, env, *kind),
        RevertConfig { kind } => osconfig::revert(update, env, *kind),
        ClearChuteConfig => osconfig::clear_chutes(update, env),

        ComputeResources => resources::compute(update, env),

        GetOsFirewall => firewall::get_os_rules(update),
        GetDeveloperFirewall => firewall::get_developer_rules(update),

        GetVirtPreamble => runtime::get_preamble(update, env),
        GetVirtDhcp => runtime::get_dhcp(update),

        GetWireless => wireless::get(update),

        PrepareImages { chute } => container::prepare_images(update, env, chute).await,
        RemoveImages { chute } => container::remove_images(update, env, chute).await,
        CreateContainers {
            chute,
            start,
            preamble,
        } => container::create(update, env, chute, *start, *preamble).await,
        StartContainers { chute } => container::start(update, env, chute).await,
        StopContainers { chute } => container::stop(update, env, chute).await,
        RestartContainers { chute } => container::restart(update, env, chute).await,
        RemoveContainers { chute } => container::remove(update, env, chute).await,
        RemoveAllContainers => container::remove_all(update, env).await,

        InstallSnaps { message } => {
            with_deadline("installer.deliver", env.settings.installer_timeout, async {
                env.installer.deliver(message).await.map_err(PipelineError::from)
            })
            .await?;
            update.progress(format!(
                "Delivered {} package(s) to the installer",
                message.sources.len()
            ));
            Ok(StepOutcome::Done)
        }

        DiffConfig => reload::diff(update, env),
        Reload { owner } => reload::reload(update, env, owner).await,
        ReloadAll => reload::reload_all(update, env).await,
        UnloadAll => reload::unload_all(update, env).await,
        WaitSystemUp => reload::wait_system_up(env).await,

        ApplyHostServices => services::apply(update, env).await,
        RestoreHostServices {
            zerotier,
            telemetry,
        } => services::restore(env, zerotier, telemetry).await,
        SetTelemetryTargets { containers } => services::set_targets(env, containers).await,

        SaveChute { chute } => save::put(update, env, chute),
        DeleteChute { name } => save::delete(update, env, name),
        RestoreChute { name, previous } => save::restore(env, name, previous.as_deref()),
        ClearStore => save::clear(update, env),
        RestoreStore { chutes } => save::restore_all(env, chutes),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Step environment over mocks and a scratch directory.

    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{PipelineSettings, StepEnv};
    use crate::confd::MockConfd;
    use crate::host_services::MockHostServices;
    use crate::installer::MockInstaller;
    use crate::reporter::ProgressSink;
    use crate::runtime::MockRuntime;
    use crate::store::ChuteStore;
    use crate::update::{Update, UpdateDescriptor};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Removes the scratch directory on drop.
    pub struct Scratch(pub PathBuf);

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    pub struct Mocks {
        pub runtime: MockRuntime,
        pub confd: MockConfd,
        pub installer: MockInstaller,
        pub services: MockHostServices,
    }

    pub fn env_with_mocks() -> (StepEnv, Mocks, Scratch) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "chute-steps-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("config")).unwrap();

        let settings = PipelineSettings {
            host_config: root.join("hostconfig.yaml"),
            os_config_dir: root.join("config"),
            sysfs_root: root.join("sys"),
            chute_data_dir: root.join("data"),
            subnet_pool: "192.168.128.0/17".parse().unwrap(),
            chute_prefix: 24,
            default_memory: None,
            runtime_timeout: Duration::from_secs(5),
            confd_timeout: Duration::from_secs(5),
            installer_timeout: Duration::from_secs(5),
        };
        let mocks = Mocks {
            runtime: MockRuntime::new(),
            confd: MockConfd::new(),
            installer: MockInstaller::new(),
            services: MockHostServices::new(),
        };
        let env = StepEnv {
            settings: Arc::new(settings),
            store: ChuteStore::open(root.join("chutes.yaml")).unwrap(),
            runtime: Arc::new(mocks.runtime.clone()),
            confd: Arc::new(mocks.confd.clone()),
            installer: Arc::new(mocks.installer.clone()),
            services: Arc::new(mocks.services.clone()),
        };
        (env, mocks, Scratch(root))
    }

    pub fn env() -> (StepEnv, Scratch) {
        let (env, _, scratch) = env_with_mocks();
        (env, scratch)
    }

    pub fn update(descriptor: serde_json::Value) -> Update {
        let descriptor: UpdateDescriptor = serde_json::from_value(descriptor).unwrap();
        Update::new(1, 1, descriptor, ProgressSink::default(), None, None)
    }
}
