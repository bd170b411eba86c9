use crate::domain::{Container, ContainerRuntime};
use anyhow::{Result, bail};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Daemon availability and project-wide resources (listing, volumes, network)
#[derive(Debug)]
pub struct SystemService {
    runtime: Arc<dyn ContainerRuntime>,
}

impl SystemService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Pings the daemon, trying to launch it and waiting up to `timeout` if it is down.
    pub fn ensure_daemon(&self, timeout: Duration, interval: Duration) -> Result<()> {
        if self.runtime.ping().is_ok() {
            return Ok(());
        }

        info!("Attempting to start docker...");
        self.runtime.start_daemon()?;

        info!(
            "Waiting for docker to be ready.... (timeout in {}s)",
            timeout.as_secs()
        );
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            thread::sleep(interval);
            match self.runtime.ping() {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Daemon not ready yet: {e}"),
            }
        }

        bail!("Failed to start docker.")
    }

    /// Containers whose name starts with `project_`
    pub fn project_containers(&self, project: &str) -> Result<Vec<Container>> {
        let prefix = format!("{project}_");
        Ok(self
            .runtime
            .list_containers()?
            .into_iter()
            .filter(|c| c.name.starts_with(&prefix))
            .collect())
    }

    /// Volume names starting with `project_`
    pub fn project_volumes(&self, project: &str) -> Result<Vec<String>> {
        let prefix = format!("{project}_");
        Ok(self
            .runtime
            .list_volumes()?
            .into_iter()
            .filter(|v| v.starts_with(&prefix))
            .collect())
    }

    pub fn remove_volume(&self, name: &str) -> Result<()> {
        info!("Removing '{name}' volume");
        self.runtime.remove_volume(name)
    }

    /// Removes the network if it exists. Returns whether anything was removed.
    pub fn remove_network(&self, name: &str) -> Result<bool> {
        if !self.runtime.network_exists(name)? {
            return Ok(false);
        }
        info!("Removing '{name}' network");
        self.runtime.remove_network(name)?;
        Ok(true)
    }
}
