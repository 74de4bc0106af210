//! Step kinds. Each variant carries its bound arguments; the behaviour lives
//! in `steps::run`.

use std::fmt;

use chute_core::hostconfig::{TelemetryConfig, ZerotierConfig};
use chute_core::{Chute, HostConfig};

use crate::installer::InstallMessage;
use crate::uci::ConfigKind;

/// Where `CreateContainers` takes interfaces, allocation and token from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleSource {
    /// What this update's generators computed.
    Planned,
    /// What the chute ran with before this update; used by rollback.
    Previous,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    // devices / host config
    GetSystemDevices,
    GetHostConfig,
    SetHostConfig { config: Box<HostConfig> },
    /// Regenerate the host config from the detected devices.
    ResetHostConfig,
    RestoreHostConfig,

    // network layout and OS config files
    ComputeNetwork,
    WriteConfig { kind: ConfigKind },
    RevertConfig { kind: ConfigKind },
    ClearChuteConfig,

    ComputeResources,

    // traffic
    GetOsFirewall,
    GetDeveloperFirewall,

    // runtime
    GetVirtPreamble,
    GetVirtDhcp,

    GetWireless,

    // containers
    PrepareImages { chute: Box<Chute> },
    RemoveImages { chute: Box<Chute> },
    CreateContainers {
        chute: Box<Chute>,
        start: bool,
        preamble: PreambleSource,
    },
    StartContainers { chute: Box<Chute> },
    StopContainers { chute: Box<Chute> },
    RestartContainers { chute: Box<Chute> },
    RemoveContainers { chute: Box<Chute> },
    RemoveAllContainers,

    InstallSnaps { message: InstallMessage },

    // configuration daemon
    DiffConfig,
    /// Reload the sections one owner generated.
    Reload { owner: String },
    ReloadAll,
    UnloadAll,
    WaitSystemUp,

    // side services
    ApplyHostServices,
    RestoreHostServices {
        zerotier: ZerotierConfig,
        telemetry: TelemetryConfig,
    },
    SetTelemetryTargets { containers: Vec<String> },

    // store
    SaveChute { chute: Box<Chute> },
    DeleteChute { name: String },
    RestoreChute {
        name: String,
        previous: Option<Box<Chute>>,
    },
    ClearStore,
    RestoreStore { chutes: Vec<Chute> },
}

/// What a successful do-step asks of the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done,
    /// Run this step in place of the next scheduled one.
    Replace(Step),
}

impl Step {
    /// `module.function` identity used in logs and progress.
    pub fn name(&self) -> &'static str {
        match self {
            Step::GetSystemDevices => "devices.get_system_devices",
            Step::GetHostConfig => "hostconfig.get",
            Step::SetHostConfig { .. } => "hostconfig.set",
            Step::ResetHostConfig => "hostconfig.reset",
            Step::RestoreHostConfig => "hostconfig.restore",
            Step::ComputeNetwork => "network.compute",
            Step::WriteConfig { .. } => "osconfig.write",
            Step::RevertConfig { .. } => "osconfig.revert",
            Step::ClearChuteConfig => "osconfig.clear_chutes",
            Step::ComputeResources => "resources.compute",
            Step::GetOsFirewall => "firewall.get_os_rules",
            Step::GetDeveloperFirewall => "firewall.get_developer_rules",
            Step::GetVirtPreamble => "runtime.get_preamble",
            Step::GetVirtDhcp => "runtime.get_dhcp",
            Step::GetWireless => "wireless.get",
            Step::PrepareImages { .. } => "container.prepare_images",
            Step::RemoveImages { .. } => "container.remove_images",
            Step::CreateContainers { .. } => "container.create",
            Step::StartContainers { .. } => "container.start",
            Step::StopContainers { .. } => "container.stop",
            Step::RestartContainers { .. } => "container.restart",
            Step::RemoveContainers { .. } => "container.remove",
            Step::RemoveAllContainers => "container.remove_all",
            Step::InstallSnaps { .. } => "installer.install",
            Step::DiffConfig => "reload.diff",
            Step::Reload { .. } => "reload.reload",
            Step::ReloadAll => "reload.reload_all",
            Step::UnloadAll => "reload.unload_all",
            Step::WaitSystemUp => "reload.wait_system_up",
            Step::ApplyHostServices => "services.apply",
            Step::RestoreHostServices { .. } => "services.restore",
            Step::SetTelemetryTargets { .. } => "services.set_telemetry_targets",
            Step::SaveChute { .. } => "save.put",
            Step::DeleteChute { .. } => "save.delete",
            Step::RestoreChute { .. } => "save.restore",
            Step::ClearStore => "save.clear",
            Step::RestoreStore { .. } => "save.restore_all",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Step::WriteConfig { kind } | Step::RevertConfig { kind } => write!(f, "({kind})"),
            Step::PrepareImages { chute }
            | Step::RemoveImages { chute }
            | Step::CreateContainers { chute, .. }
            | Step::StartContainers { chute }
            | Step::StopContainers { chute }
            | Step::RestartContainers { chute }
            | Step::RemoveContainers { chute }
            | Step::SaveChute { chute } => write!(f, "({}:{})", chute.name, chute.version),
            Step::DeleteChute { name } | Step::RestoreChute { name, .. } => write!(f, "({name})"),
            Step::Reload { owner } => write!(f, "({owner})"),
            _ => Ok(()),
        }
    }
}
