//! chute-core: chute model, host configuration, daemon configuration.
//! The pipeline and the daemon both depend on this crate.

pub mod chute;
pub mod config;
pub mod fs;
pub mod hostconfig;

pub use chute::{
    Chute, ChuteError, ChuteSpec, ChuteState, Command, DhcpSpec, FirewallRuleSpec,
    InterfaceSpec, InterfaceType, PortBinding, Service, ServiceRequests, ServiceType,
    WirelessSpec,
};
pub use config::ChutedConfig;
pub use hostconfig::{HostConfig, HostConfigError};
