//! chuted integration test harness.
//!
//! Every test builds a complete node in a temp directory: chute store,
//! host config, OS config dir, a fake sysfs tree, and the in-process mocks
//! for the container engine, config daemon, installer, side services and
//! controller. Updates go through the real `UpdateManager`.
//!
//!   cargo test --test integration

mod infra;

mod host;
mod lifecycle;
mod queue;
mod rollback;

pub use infra::*;
