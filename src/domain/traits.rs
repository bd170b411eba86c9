use super::{Container, LaunchOptions};
use anyhow::Result;
use std::fmt::Debug;
use std::time::Duration;

/// Trait for container runtime operations
///
/// Lookups return `Ok(None)` / `Ok(false)` when the object is absent; errors
/// are reserved for the runtime itself failing. Failures that are worth
/// retrying carry a [`RuntimeError::Api`](super::RuntimeError::Api).
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Check that the daemon answers
    fn ping(&self) -> Result<()>;

    /// Ask the OS to launch the daemon (not supported everywhere)
    fn start_daemon(&self) -> Result<()>;

    fn image_exists(&self, image: &str) -> Result<bool>;

    fn pull_image(&self, image: &str) -> Result<()>;

    /// Look a container up by exact name
    fn get_container(&self, name: &str) -> Result<Option<Container>>;

    /// All containers, running or not
    fn list_containers(&self) -> Result<Vec<Container>>;

    /// Create (but do not start) a container
    fn create_container(&self, options: &LaunchOptions) -> Result<Container>;

    fn start_container(&self, name: &str) -> Result<()>;

    fn stop_container(&self, name: &str) -> Result<()>;

    fn remove_container(&self, name: &str) -> Result<()>;

    /// Copy the container's output to the terminal until it stops or we are interrupted
    fn stream_logs(&self, name: &str, since: Duration) -> Result<()>;

    fn network_exists(&self, name: &str) -> Result<bool>;

    fn create_network(&self, name: &str) -> Result<()>;

    fn remove_network(&self, name: &str) -> Result<()>;

    fn volume_exists(&self, name: &str) -> Result<bool>;

    fn create_volume(&self, name: &str) -> Result<()>;

    fn remove_volume(&self, name: &str) -> Result<()>;

    fn list_volumes(&self) -> Result<Vec<String>>;
}
