//! chute-pipeline: the update pipeline behind chuted.
//!
//! Updates enter through [`UpdateManager::add`], are planned by the
//! planners into a priority-ordered plan map, and are executed step by step
//! with rollback on failure. External systems (container engine, config
//! daemon, installer, controller, side services) sit behind traits so the
//! pipeline runs unchanged against mocks.

pub mod confd;
pub mod controller;
pub mod error;
pub mod executor;
pub mod host_services;
pub mod installer;
pub mod manager;
pub mod patch;
pub mod plan;
pub mod planners;
pub mod reporter;
pub mod runtime;
pub mod step;
pub mod steps;
pub mod store;
pub mod uci;
pub mod update;
pub mod update_log;

pub use confd::{ConfdClient, MockConfd, SectionStatus, SocketConfd};
pub use controller::{ControllerClient, HttpController, MockController};
pub use error::{ErrorKind, PipelineError, Result};
pub use host_services::{CommandHostServices, HostServices, MockHostServices};
pub use installer::{InstallerClient, MockInstaller, SocketInstaller};
pub use manager::{SubmitError, UpdateManager, UpdateTicket};
pub use plan::{PlanEntry, PlanMap};
pub use planners::{PlanContext, Verdict};
pub use reporter::{ProgressSink, ReporterHandle, ReporterSettings};
pub use runtime::{ContainerRuntime, DockerCli, MockRuntime};
pub use step::{PreambleSource, Step, StepOutcome};
pub use steps::{PipelineSettings, StepEnv};
pub use store::ChuteStore;
pub use update::{
    Update, UpdateCallback, UpdateClass, UpdateDescriptor, UpdateOutcome, UpdateState, UpdateType,
};
pub use update_log::{UpdateLog, UpdateSummary};
