use crate::domain::{Container, ContainerRuntime, ContainerState, LaunchOptions, RuntimeError};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub state: ContainerState,
    pub options: Option<LaunchOptions>,
}

/// In-memory runtime recording every call as `"op:arg"`
#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: RwLock<BTreeMap<String, MockContainer>>,
    images: RwLock<BTreeSet<String>>,
    networks: RwLock<BTreeSet<String>>,
    volumes: RwLock<BTreeSet<String>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Option<String>>,
    delays: RwLock<HashMap<String, Duration>>,
    ping_failures: RwLock<u32>,
    pull_failures: RwLock<u32>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, name: &str, state: ContainerState) {
        self.containers.write().unwrap().insert(
            name.to_string(),
            MockContainer {
                id: format!("id-{name}"),
                state,
                options: None,
            },
        );
    }

    pub fn add_image(&self, image: &str) {
        self.images.write().unwrap().insert(image.to_string());
    }

    pub fn add_network(&self, name: &str) {
        self.networks.write().unwrap().insert(name.to_string());
    }

    pub fn add_volume(&self, name: &str) {
        self.volumes.write().unwrap().insert(name.to_string());
    }

    /// Fail every call whose op (`"pull"`) or full command (`"create:sentry_redis"`) matches
    pub fn set_fail_on(&self, operation: &str) {
        *self.fail_on.write().unwrap() = Some(operation.to_string());
    }

    /// Sleep before answering the given full command
    pub fn set_delay(&self, command: &str, delay: Duration) {
        self.delays
            .write()
            .unwrap()
            .insert(command.to_string(), delay);
    }

    /// The next `n` pings fail
    pub fn set_ping_failures(&self, n: u32) {
        *self.ping_failures.write().unwrap() = n;
    }

    /// The next `n` pulls fail with a transient API error
    pub fn set_pull_failures(&self, n: u32) {
        *self.pull_failures.write().unwrap() = n;
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn container_exists(&self, name: &str) -> bool {
        self.containers.read().unwrap().contains_key(name)
    }

    pub fn get_state(&self, name: &str) -> Option<ContainerState> {
        self.containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.state.clone())
    }

    /// Options the container was last created with
    pub fn created_options(&self, name: &str) -> Option<LaunchOptions> {
        self.containers
            .read()
            .unwrap()
            .get(name)
            .and_then(|c| c.options.clone())
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.read().unwrap().contains(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.read().unwrap().contains(name)
    }

    fn record(&self, op: &str, arg: Option<&str>) -> Result<()> {
        let cmd = match arg {
            Some(arg) => format!("{op}:{arg}"),
            None => op.to_string(),
        };
        self.commands.write().unwrap().push(cmd.clone());

        let delay = self.delays.read().unwrap().get(&cmd).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        if let Some(ref fail_on) = *self.fail_on.read().unwrap() {
            if fail_on == op || fail_on == &cmd {
                return Err(RuntimeError::api(cmd, format!("Mock failure on: {op}")).into());
            }
        }
        Ok(())
    }

    fn take_failure(counter: &RwLock<u32>) -> bool {
        let mut remaining = counter.write().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    fn set_state(&self, name: &str, state: ContainerState) -> Result<()> {
        match self.containers.write().unwrap().get_mut(name) {
            Some(container) => {
                container.state = state;
                Ok(())
            }
            None => Err(RuntimeError::api(name, "No such container").into()),
        }
    }
}

impl ContainerRuntime for MockRuntime {
    fn ping(&self) -> Result<()> {
        self.record("ping", None)?;
        if Self::take_failure(&self.ping_failures) {
            return Err(RuntimeError::api("ping", "daemon unreachable").into());
        }
        Ok(())
    }

    fn start_daemon(&self) -> Result<()> {
        self.record("start_daemon", None)
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        self.record("image_exists", Some(image))?;
        Ok(self.images.read().unwrap().contains(image))
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        self.record("pull", Some(image))?;
        if Self::take_failure(&self.pull_failures) {
            return Err(RuntimeError::api(format!("pulling {image}"), "unexpected EOF").into());
        }
        self.images.write().unwrap().insert(image.to_string());
        Ok(())
    }

    fn get_container(&self, name: &str) -> Result<Option<Container>> {
        self.record("get_container", Some(name))?;
        Ok(self
            .containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| Container::new(c.id.clone(), name, c.state.clone())))
    }

    fn list_containers(&self) -> Result<Vec<Container>> {
        self.record("list_containers", None)?;
        Ok(self
            .containers
            .read()
            .unwrap()
            .iter()
            .map(|(name, c)| Container::new(c.id.clone(), name.clone(), c.state.clone()))
            .collect())
    }

    fn create_container(&self, options: &LaunchOptions) -> Result<Container> {
        self.record("create", Some(&options.name))?;
        let id = format!("id-{}", options.name);
        self.containers.write().unwrap().insert(
            options.name.clone(),
            MockContainer {
                id: id.clone(),
                state: ContainerState::Stopped,
                options: Some(options.clone()),
            },
        );
        Ok(Container::new(id, &options.name, ContainerState::Stopped))
    }

    fn start_container(&self, name: &str) -> Result<()> {
        self.record("start", Some(name))?;
        self.set_state(name, ContainerState::Running)
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        self.record("stop", Some(name))?;
        self.set_state(name, ContainerState::Stopped)
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.record("remove", Some(name))?;
        self.containers.write().unwrap().remove(name);
        Ok(())
    }

    fn stream_logs(&self, name: &str, _since: Duration) -> Result<()> {
        self.record("logs", Some(name))
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        self.record("network_exists", Some(name))?;
        Ok(self.has_network(name))
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.record("create_network", Some(name))?;
        self.add_network(name);
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.record("remove_network", Some(name))?;
        self.networks.write().unwrap().remove(name);
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool> {
        self.record("volume_exists", Some(name))?;
        Ok(self.has_volume(name))
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        self.record("create_volume", Some(name))?;
        self.add_volume(name);
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.record("remove_volume", Some(name))?;
        self.volumes.write().unwrap().remove(name);
        Ok(())
    }

    fn list_volumes(&self) -> Result<Vec<String>> {
        self.record("list_volumes", None)?;
        Ok(self.volumes.read().unwrap().iter().cloned().collect())
    }
}
