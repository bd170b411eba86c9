use crate::domain::{
    Container, ContainerRuntime, ContainerState, LaunchOptions, RuntimeError, scoped_name,
};
use crate::services::CancelToken;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Image pulls fail intermittently in CI with unhelpful API errors; retry a few times.
pub const PULL_ATTEMPTS: u32 = 5;

/// Lifecycle of individual containers, volumes and networks.
#[derive(Debug)]
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Brings one service's container into the running state.
    ///
    /// Returns `None` only for on-demand services when `always_start` is
    /// false; their image and volumes are still prepared so a later attach
    /// starts quickly.
    pub fn ensure_running(
        &self,
        options: &LaunchOptions,
        fast: bool,
        always_start: bool,
        cancel: &CancelToken,
    ) -> Result<Option<Container>> {
        let name = &options.name;

        cancel.check()?;
        if !fast {
            if options.pull {
                info!("Pulling image '{}'", options.image);
                self.pull_with_retry(&options.image)?;
            } else if !self.runtime.image_exists(&options.image)? {
                // First run: pull regardless of the pull flag
                info!("Pulling image '{}'", options.image);
                self.pull_with_retry(&options.image)?;
            }
        }

        cancel.check()?;
        for volume in options.named_volumes() {
            self.ensure_volume(&scoped_name(&options.project, volume))?;
        }

        if options.with_devserver && !always_start {
            warn!(
                "Not starting container '{name}' because it should be started on-demand with devserver."
            );
            return Ok(None);
        }

        cancel.check()?;
        let listening = options.listening();

        if let Some(container) = self.runtime.get_container(name)? {
            // A freshly pulled image means the old container is stale, unless
            // we were told to go fast or the devserver manages it.
            let reuse = fast || options.with_devserver || !options.pull;

            if reuse {
                info!("Starting EXISTING container '{name}' {listening}");
                if !container.is_running() {
                    self.runtime.start_container(name)?;
                }
                return Ok(Some(Container {
                    state: ContainerState::Running,
                    ..container
                }));
            }

            if container.is_running() {
                info!("Stopping container '{name}'");
                self.runtime.stop_container(name)?;
            }
            info!("Removing container '{name}'");
            self.runtime.remove_container(name)?;
        }

        cancel.check()?;
        info!("Creating container '{name}'");
        let container = self
            .runtime
            .create_container(&options.with_scoped_volumes())?;

        info!("Starting container '{name}' {listening}");
        self.runtime.start_container(name)?;

        Ok(Some(Container {
            state: ContainerState::Running,
            ..container
        }))
    }

    /// Stops a container; absent or already stopped containers are fine.
    pub fn stop(&self, name: &str) -> Result<()> {
        match self.runtime.get_container(name)? {
            Some(container) if container.is_running() => {
                info!("Stopping '{name}' container");
                self.runtime.stop_container(name)?;
                info!("Stopped '{name}' container");
            }
            Some(_) => debug!("{name} is already stopped"),
            None => debug!("{name} does not exist"),
        }
        Ok(())
    }

    /// Stops and deletes a container. Returns false when there was nothing to remove.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let Some(container) = self.runtime.get_container(name)? else {
            warn!("WARNING: non-existent container '{name}'");
            return Ok(false);
        };

        if container.is_running() {
            info!("Stopping '{name}' container");
            self.runtime.stop_container(name)?;
        }
        info!("Removing '{name}' container");
        self.runtime.remove_container(name)?;
        Ok(true)
    }

    pub fn ensure_network(&self, name: &str) -> Result<()> {
        if self.runtime.network_exists(name)? {
            return Ok(());
        }
        warn!("Creating '{name}' network");
        self.runtime.create_network(name)
    }

    pub fn ensure_volume(&self, name: &str) -> Result<()> {
        if self.runtime.volume_exists(name)? {
            return Ok(());
        }
        warn!("Creating '{name}' volume");
        self.runtime.create_volume(name)
    }

    pub fn stream_logs(&self, name: &str, since: Duration) -> Result<()> {
        self.runtime.stream_logs(name, since)
    }

    fn pull_with_retry(&self, image: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.runtime.pull_image(image) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PULL_ATTEMPTS && is_transient(&e) => {
                    debug!("Pull of {image} failed (attempt {attempt}/{PULL_ATTEMPTS}): {e}");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RuntimeError>()
        .is_some_and(RuntimeError::is_transient)
}
