//! On-demand compute for locally managed providers
//!
//! [`ComputeManager`] decides when containers start and stop; [`ContainerControl`] is how it
//! asks. [`DockerControl`] drives any Docker-compatible CLI.

mod control;
mod docker;
mod manager;

pub use control::ContainerControl;
pub use docker::DockerControl;
pub use manager::{ComputeManager, ComputeStatus};
