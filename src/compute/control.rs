//! The container control seam
//!
//! The lifecycle manager only ever calls these four operations. Implement the trait against
//! whatever runs the model servers (Docker, Podman, a cluster API); [`super::DockerControl`] is
//! the stock implementation.

use crate::errors::ComputeError;
use async_trait::async_trait;
use url::Url;

/// Start, stop and inspect the containers that back managed providers.
///
/// # Implementation Notes
///
/// - All methods should apply their own timeouts
/// - Implementations must be thread-safe; calls for different containers may run concurrently
/// - `start` on an already running container should succeed
#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Start the container. Returning does not imply the model server is ready yet.
    ///
    /// # Errors
    /// * `ComputeError::Control` - the runtime refused or failed to start it. The caller adds
    ///   which provider the container belongs to.
    async fn start(&self, container: &str) -> Result<(), ComputeError>;

    /// Stop the container, freeing its GPU.
    async fn stop(&self, container: &str) -> Result<(), ComputeError>;

    /// Whether the runtime reports the container as running.
    async fn is_running(&self, container: &str) -> Result<bool, ComputeError>;

    /// Whether the model server answers its readiness endpoint successfully.
    async fn probe_ready(&self, url: &Url) -> bool;
}
