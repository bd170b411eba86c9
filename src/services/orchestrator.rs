use crate::domain::{Container, UsageError};
use crate::infra::config::DEFAULT_STARTUP_TIMEOUT_SECS;
use crate::services::resolver::ServiceTable;
use crate::services::{CancelToken, ContainerService, SystemService};
use anyhow::{Context, Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How far back `attach` replays container output.
pub const LOG_LOOKBACK: Duration = Duration::from_secs(20);

pub const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Orchestrates workflows spanning several services: up, down, rm, attach
pub struct Orchestrator {
    container_service: Arc<ContainerService>,
    system_service: Arc<SystemService>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        container_service: Arc<ContainerService>,
        system_service: Arc<SystemService>,
    ) -> Self {
        Self {
            container_service,
            system_service,
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            poll_interval: DAEMON_POLL_INTERVAL,
        }
    }

    /// Overrides how long to wait for the daemon, and how often to ask.
    pub fn with_daemon_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.startup_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    fn ensure_daemon(&self) -> Result<()> {
        self.system_service
            .ensure_daemon(self.startup_timeout, self.poll_interval)
    }

    /// Starts the selected services in parallel, one worker per service.
    ///
    /// The first failure cancels the remaining workers and is returned
    /// immediately, without waiting for them.
    pub fn up(
        &self,
        project: &str,
        table: &ServiceTable,
        include: &[String],
        exclude: &[String],
        fast: bool,
    ) -> Result<()> {
        let selected = select(table, include, exclude)?;

        if fast {
            warn!(
                "Warning! Fast mode completely eschews any image updating, so services may be stale."
            );
        }

        self.ensure_daemon()?;
        self.container_service.ensure_network(project)?;

        let jobs = selected
            .into_iter()
            .map(|name| {
                let options = table[&name].clone();
                (name, options)
            })
            .collect();

        let container_service = Arc::clone(&self.container_service);
        run_fail_fast(jobs, move |options, cancel| {
            container_service
                .ensure_running(&options, fast, false, cancel)
                .map(|_| ())
        })
    }

    /// Stops containers of `project`, or only those of `services` when given.
    pub fn down(&self, project: &str, table: &ServiceTable, services: &[String]) -> Result<()> {
        validate_names(table, services)?;

        self.ensure_daemon()?;

        let prefix = format!("{project}_");
        let containers: Vec<Container> = self
            .system_service
            .project_containers(project)?
            .into_iter()
            .filter(|c| {
                let service = &c.name[prefix.len()..];
                services.is_empty() || services.iter().any(|s| s == service)
            })
            .collect();

        if containers.is_empty() {
            info!("No containers to stop");
            return Ok(());
        }

        let jobs = containers
            .into_iter()
            .map(|c| (c.name.clone(), c.name))
            .collect();

        let container_service = Arc::clone(&self.container_service);
        run_fail_fast(jobs, move |name, cancel| {
            cancel.check()?;
            container_service.stop(&name)
        })
    }

    /// Validates an `rm` request against the enabled services and returns
    /// the services it covers.
    pub fn select_for_removal(table: &ServiceTable, services: &[String]) -> Result<Vec<String>> {
        validate_names(table, services)?;
        if services.is_empty() {
            return Ok(table.keys().cloned().collect());
        }
        let unique: BTreeSet<&String> = services.iter().collect();
        Ok(unique.into_iter().cloned().collect())
    }

    /// Deletes containers and data of `selected` services.
    ///
    /// `table` must be resolved without only_if filtering: services started
    /// by explicit name still own their volumes and use the network. A
    /// volume goes only when every service that mounts it is being removed.
    /// The network goes only when every service is.
    pub fn rm(&self, project: &str, table: &ServiceTable, selected: &[String]) -> Result<()> {
        validate_names(table, selected)?;
        self.ensure_daemon()?;

        for service in selected {
            self.container_service.remove(&table[service].name)?;
        }

        let selected: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
        let removing_all = table.keys().all(|name| selected.contains(name.as_str()));

        let mut owners: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (service, options) in table {
            for volume in options.named_volumes() {
                owners.entry(volume).or_default().insert(service.as_str());
            }
        }

        let prefix = format!("{project}_");
        for volume in self.system_service.project_volumes(project)? {
            let local = &volume[prefix.len()..];
            let deletable = removing_all
                || owners
                    .get(local)
                    .is_some_and(|users| users.iter().all(|s| selected.contains(s)));
            if deletable {
                self.system_service.remove_volume(&volume)?;
            }
        }

        if removing_all {
            self.system_service.remove_network(project)?;
        }

        Ok(())
    }

    /// Starts one service (on-demand ones included) for foreground use.
    pub fn attach(
        &self,
        project: &str,
        table: &ServiceTable,
        service: &str,
        fast: bool,
    ) -> Result<AttachedService> {
        let options = table
            .get(service)
            .ok_or_else(|| unknown_service(table, service))?;

        self.ensure_daemon()?;
        self.container_service.ensure_network(project)?;

        let container = self
            .container_service
            .ensure_running(options, fast, true, &CancelToken::new())?
            .ok_or_else(|| anyhow!("{service} was not started"))?;

        Ok(AttachedService {
            service: service.to_string(),
            container,
            container_service: Arc::clone(&self.container_service),
            interrupted: AtomicBool::new(false),
            torn_down: Mutex::new(false),
        })
    }
}

/// A service started by `attach`, torn down when the user is done with it.
#[derive(Debug)]
pub struct AttachedService {
    service: String,
    container: Container,
    container_service: Arc<ContainerService>,
    interrupted: AtomicBool,
    torn_down: Mutex<bool>,
}

impl AttachedService {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Blocks while copying the container's output to the terminal.
    pub fn follow_logs(&self) -> Result<()> {
        self.container_service
            .stream_logs(&self.container.name, LOG_LOOKBACK)
    }

    /// Stops and removes the container once. Concurrent callers wait for
    /// the call in progress; after a success later calls do nothing.
    pub fn teardown(&self) -> Result<()> {
        let mut torn_down = self.torn_down.lock().unwrap_or_else(PoisonError::into_inner);
        if *torn_down {
            return Ok(());
        }
        info!("Stopping {}", self.service);
        self.container_service.remove(&self.container.name)?;
        *torn_down = true;
        Ok(())
    }

    /// Called from the signal handler: marks the session interrupted and
    /// tears down.
    pub fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.teardown()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Follows logs until the stream ends, then tears down, waiting for a
    /// teardown already started by `interrupt`. A stream cut short by an
    /// interrupt is not an error.
    pub fn run(&self) -> Result<()> {
        let logs = self.follow_logs();
        self.teardown()?;
        match logs {
            Err(e) if self.is_interrupted() => {
                debug!("Log stream ended by interrupt: {e:#}");
                Ok(())
            }
            other => other,
        }
    }
}

/// Picks services for `up`: everything, or `include`, minus `exclude`.
///
/// Every name is checked before anything is removed. Excluding a known
/// service that was not selected is a no-op.
pub fn select(
    table: &ServiceTable,
    include: &[String],
    exclude: &[String],
) -> Result<Vec<String>, UsageError> {
    for name in include.iter().chain(exclude) {
        if !table.contains_key(name) {
            return Err(unknown_service(table, name));
        }
    }

    let mut selected: BTreeSet<&String> = if include.is_empty() {
        table.keys().collect()
    } else {
        include.iter().collect()
    };

    for name in exclude {
        selected.remove(name);
    }

    if selected.is_empty() {
        return Err(UsageError::NothingSelected);
    }

    Ok(selected.into_iter().cloned().collect())
}

fn validate_names(table: &ServiceTable, names: &[String]) -> Result<(), UsageError> {
    match names.iter().find(|n| !table.contains_key(*n)) {
        Some(name) => Err(unknown_service(table, name)),
        None => Ok(()),
    }
}

fn unknown_service(table: &ServiceTable, name: &str) -> UsageError {
    UsageError::UnknownService {
        name: name.to_string(),
        available: table.keys().cloned().collect(),
    }
}

/// Runs `work` once per job, each on its own thread.
///
/// Returns on the first error after cancelling the shared token; workers
/// still blocked in a runtime call are not joined.
fn run_fail_fast<T, F>(jobs: Vec<(String, T)>, work: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T, &CancelToken) -> Result<()> + Send + Sync + 'static,
{
    let total = jobs.len();
    let cancel = CancelToken::new();
    let work = Arc::new(work);
    let (tx, rx) = mpsc::channel();

    for (label, job) in jobs {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let work = Arc::clone(&work);
        let thread_label = label.clone();

        thread::Builder::new()
            .name(format!("devservices-{thread_label}"))
            .spawn(move || {
                let result = work(job, &cancel);
                let _ = tx.send((label, result));
            })
            .with_context(|| format!("spawning worker for {thread_label}"))?;
    }
    drop(tx);

    for _ in 0..total {
        let Ok((label, result)) = rx.recv() else {
            cancel.cancel();
            bail!("a worker exited without reporting");
        };
        if let Err(e) = result {
            cancel.cancel();
            error!("{label}: {e:#}");
            return Err(e.context(format!("{label} failed")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContainerState, HostFacts};
    use crate::infra::config::AppConfig;
    use crate::services::resolver::resolve;
    use crate::test_support::MockRuntime;

    fn table(toml: &str) -> ServiceTable {
        let config: AppConfig = toml::from_str(toml).unwrap();
        resolve(&config, "sentry", &HostFacts::new("linux", "x86_64"), false).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn create_test_orchestrator() -> (Orchestrator, Arc<MockRuntime>) {
        let mock = Arc::new(MockRuntime::new());
        let container_service = Arc::new(ContainerService::new(mock.clone()));
        let system_service = Arc::new(SystemService::new(mock.clone()));
        let orchestrator = Orchestrator::new(container_service, system_service)
            .with_daemon_wait(Duration::from_millis(50), Duration::from_millis(1));
        (orchestrator, mock)
    }

    const THREE: &str = r#"
[services.postgres]
image = "postgres"
[services.redis]
image = "redis"
[services.kafka]
image = "kafka"
"#;

    #[test]
    fn select_defaults_to_everything() {
        let t = table(THREE);
        assert_eq!(
            select(&t, &[], &[]).unwrap(),
            names(&["kafka", "postgres", "redis"])
        );
    }

    #[test]
    fn select_applies_exclude_after_include() {
        let t = table(THREE);
        assert_eq!(
            select(&t, &names(&["redis", "kafka"]), &names(&["kafka"])).unwrap(),
            names(&["redis"])
        );
        // excluding a known service that was never selected is a no-op
        assert_eq!(
            select(&t, &names(&["redis"]), &names(&["postgres"])).unwrap(),
            names(&["redis"])
        );
        assert_eq!(
            select(&t, &[], &names(&["postgres"])).unwrap(),
            names(&["kafka", "redis"])
        );
    }

    #[test]
    fn select_rejects_unknown_names() {
        let t = table(THREE);
        let err = select(&t, &names(&["redis", "mysql"]), &[]).unwrap_err();
        assert_eq!(
            err,
            UsageError::UnknownService {
                name: "mysql".into(),
                available: names(&["kafka", "postgres", "redis"]),
            }
        );
        assert!(select(&t, &[], &names(&["mysql"])).is_err());
    }

    #[test]
    fn select_excluding_everything_is_a_usage_error() {
        let t = table(THREE);
        assert_eq!(
            select(&t, &names(&["redis"]), &names(&["redis"])),
            Err(UsageError::NothingSelected)
        );
    }

    #[test]
    fn up_starts_selected_services_on_project_network() {
        let (orchestrator, mock) = create_test_orchestrator();
        let t = table(THREE);

        orchestrator
            .up("sentry", &t, &[], &names(&["kafka"]), false)
            .unwrap();

        assert_eq!(mock.get_state("sentry_postgres"), Some(ContainerState::Running));
        assert_eq!(mock.get_state("sentry_redis"), Some(ContainerState::Running));
        assert_eq!(mock.get_state("sentry_kafka"), None);

        let commands = mock.get_commands();
        let network = commands
            .iter()
            .position(|c| c == "create_network:sentry")
            .unwrap();
        let first_create = commands
            .iter()
            .position(|c| c.starts_with("create:"))
            .unwrap();
        assert!(network < first_create);
    }

    #[test]
    fn up_with_unknown_service_makes_no_runtime_calls() {
        let (orchestrator, mock) = create_test_orchestrator();
        let t = table(THREE);

        let err = orchestrator
            .up("sentry", &t, &names(&["mysql"]), &[], false)
            .unwrap_err();

        assert!(err.downcast_ref::<UsageError>().is_some());
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn up_reports_first_failure() {
        let (orchestrator, mock) = create_test_orchestrator();
        mock.set_fail_on("create:sentry_redis");
        let t = table(THREE);

        let err = orchestrator.up("sentry", &t, &[], &[], false).unwrap_err();
        assert!(format!("{err:#}").contains("redis failed"));
    }

    #[test]
    fn down_stops_only_project_containers() {
        let (orchestrator, mock) = create_test_orchestrator();
        mock.add_container("sentry_postgres", ContainerState::Running);
        mock.add_container("sentry_redis", ContainerState::Running);
        mock.add_container("other_redis", ContainerState::Running);
        let t = table(THREE);

        orchestrator.down("sentry", &t, &names(&["redis"])).unwrap();
        assert_eq!(mock.get_state("sentry_redis"), Some(ContainerState::Stopped));
        assert_eq!(mock.get_state("sentry_postgres"), Some(ContainerState::Running));

        orchestrator.down("sentry", &t, &[]).unwrap();
        assert_eq!(mock.get_state("sentry_postgres"), Some(ContainerState::Stopped));
        assert_eq!(mock.get_state("other_redis"), Some(ContainerState::Running));
    }

    #[test]
    fn down_with_nothing_running_is_fine() {
        let (orchestrator, _mock) = create_test_orchestrator();
        orchestrator.down("sentry", &table(THREE), &[]).unwrap();
    }

    #[test]
    fn down_rejects_unknown_names() {
        let (orchestrator, mock) = create_test_orchestrator();
        assert!(
            orchestrator
                .down("sentry", &table(THREE), &names(&["mysql"]))
                .is_err()
        );
        assert!(mock.get_commands().is_empty());
    }

    const SHARED: &str = r#"
[services.kafka]
image = "kafka"
volumes = { kafka = "/var/lib/kafka", shared = "/shared" }
[services.zookeeper]
image = "zookeeper"
volumes = { zookeeper = "/data", shared = "/shared" }
[services.redis]
image = "redis"
volumes = { redis = "/data" }
"#;

    fn seed_volumes(mock: &MockRuntime) {
        for v in ["kafka", "shared", "zookeeper", "redis"] {
            mock.add_volume(&format!("sentry_{v}"));
        }
        mock.add_volume("other_redis");
        mock.add_network("sentry");
    }

    #[test]
    fn partial_rm_keeps_shared_volumes_and_network() {
        let (orchestrator, mock) = create_test_orchestrator();
        seed_volumes(&mock);
        mock.add_container("sentry_kafka", ContainerState::Running);
        let t = table(SHARED);

        let selected = Orchestrator::select_for_removal(&t, &names(&["kafka"])).unwrap();
        orchestrator.rm("sentry", &t, &selected).unwrap();

        assert!(!mock.container_exists("sentry_kafka"));
        assert!(!mock.has_volume("sentry_kafka"));
        assert!(mock.has_volume("sentry_shared"));
        assert!(mock.has_volume("sentry_zookeeper"));
        assert!(mock.has_volume("sentry_redis"));
        assert!(mock.has_network("sentry"));
    }

    #[test]
    fn rm_removes_shared_volume_when_all_users_go() {
        let (orchestrator, mock) = create_test_orchestrator();
        seed_volumes(&mock);
        let t = table(SHARED);

        let selected =
            Orchestrator::select_for_removal(&t, &names(&["kafka", "zookeeper"])).unwrap();
        orchestrator.rm("sentry", &t, &selected).unwrap();

        assert!(!mock.has_volume("sentry_shared"));
        assert!(mock.has_volume("sentry_redis"));
        assert!(mock.has_network("sentry"));
    }

    #[test]
    fn rm_everything_removes_project_volumes_and_network() {
        let (orchestrator, mock) = create_test_orchestrator();
        seed_volumes(&mock);
        mock.add_volume("sentry_leftover");
        let t = table(SHARED);

        let selected = Orchestrator::select_for_removal(&t, &[]).unwrap();
        assert_eq!(selected, names(&["kafka", "redis", "zookeeper"]));
        orchestrator.rm("sentry", &t, &selected).unwrap();

        assert!(!mock.has_volume("sentry_leftover"));
        assert!(!mock.has_volume("sentry_shared"));
        assert!(mock.has_volume("other_redis"));
        assert!(!mock.has_network("sentry"));
    }

    #[test]
    fn attach_unknown_service_makes_no_runtime_calls() {
        let (orchestrator, mock) = create_test_orchestrator();
        let err = orchestrator
            .attach("sentry", &table(THREE), "mysql", false)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<UsageError>(),
            Some(UsageError::UnknownService { .. })
        ));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn teardown_runs_once() {
        let (orchestrator, mock) = create_test_orchestrator();
        let attached = orchestrator
            .attach("sentry", &table(THREE), "redis", false)
            .unwrap();

        attached.teardown().unwrap();
        attached.teardown().unwrap();

        let removes = mock
            .get_commands()
            .iter()
            .filter(|c| *c == "remove:sentry_redis")
            .count();
        assert_eq!(removes, 1);
    }

    const GATED_SHARED: &str = r#"
[settings]
kafka = false

[services.kafka]
image = "kafka"
volumes = { kafka = "/var/lib/kafka", shared = "/shared" }

[services.zookeeper]
image = "zookeeper"
only_if = { setting = "kafka" }
volumes = { shared = "/shared" }
"#;

    #[test]
    fn rm_counts_gated_services_as_volume_owners() {
        let (orchestrator, mock) = create_test_orchestrator();
        let config: AppConfig = toml::from_str(GATED_SHARED).unwrap();
        let host = HostFacts::new("linux", "x86_64");
        let enabled = resolve(&config, "sentry", &host, false).unwrap();
        let all = resolve(&config, "sentry", &host, true).unwrap();

        // zookeeper was started by name, bypassing its only_if
        orchestrator
            .up("sentry", &all, &names(&["kafka", "zookeeper"]), &[], false)
            .unwrap();
        assert!(mock.has_volume("sentry_shared"));

        let selected = Orchestrator::select_for_removal(&enabled, &[]).unwrap();
        assert_eq!(selected, names(&["kafka"]));
        orchestrator.rm("sentry", &all, &selected).unwrap();

        assert!(!mock.container_exists("sentry_kafka"));
        assert!(!mock.has_volume("sentry_kafka"));
        assert!(mock.has_volume("sentry_shared"));
        assert!(mock.has_network("sentry"));
        assert_eq!(mock.get_state("sentry_zookeeper"), Some(ContainerState::Running));
    }

    fn attached_redis() -> (Arc<AttachedService>, Arc<MockRuntime>) {
        let (orchestrator, mock) = create_test_orchestrator();
        let attached = orchestrator
            .attach("sentry", &table(THREE), "redis", false)
            .unwrap();
        (Arc::new(attached), mock)
    }

    #[test]
    fn run_waits_for_teardown_started_by_interrupt() {
        let (attached, mock) = attached_redis();
        mock.set_delay("stop:sentry_redis", Duration::from_millis(300));
        // the interrupt also ends the log stream
        mock.set_fail_on("logs");

        let handler = {
            let attached = Arc::clone(&attached);
            thread::spawn(move || attached.interrupt())
        };
        thread::sleep(Duration::from_millis(50));

        attached.run().unwrap();
        assert!(!mock.container_exists("sentry_redis"));
        handler.join().unwrap().unwrap();
    }

    #[test]
    fn interrupt_waits_for_teardown_already_running() {
        let (attached, mock) = attached_redis();
        mock.set_delay("stop:sentry_redis", Duration::from_millis(300));
        mock.set_fail_on("logs");

        let handler = {
            let attached = Arc::clone(&attached);
            let mock = Arc::clone(&mock);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                attached.interrupt().unwrap();
                mock.container_exists("sentry_redis")
            })
        };

        attached.run().unwrap();
        assert!(!handler.join().unwrap());
        let removes = mock
            .get_commands()
            .iter()
            .filter(|c| *c == "remove:sentry_redis")
            .count();
        assert_eq!(removes, 1);
    }

    #[test]
    fn broken_log_stream_without_interrupt_is_an_error() {
        let (attached, mock) = attached_redis();
        mock.set_fail_on("logs");

        assert!(attached.run().is_err());
        assert!(!mock.container_exists("sentry_redis"));
    }

    #[test]
    fn failed_teardown_can_be_retried() {
        let (attached, mock) = attached_redis();
        mock.set_fail_on("stop:sentry_redis");
        assert!(attached.teardown().is_err());

        mock.set_fail_on("none");
        attached.teardown().unwrap();
        assert!(!mock.container_exists("sentry_redis"));
    }
}
