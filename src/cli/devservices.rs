use crate::domain::{ContainerRuntime, HostFacts};
use crate::infra::DockerAdapter;
use crate::infra::config::{AppConfig, load_app_config};
use crate::services::{
    AttachedService, ContainerService, DAEMON_POLL_INTERVAL, Orchestrator, ServiceTable,
    SystemService, resolve,
};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Args, Debug, Default)]
pub struct UpArgs {
    /// Services to bring up (default: every enabled service)
    pub services: Vec<String>,
    /// Project the containers belong to (default: [project] name)
    #[arg(long)]
    pub project: Option<String>,
    /// Services to leave out
    #[arg(long)]
    pub exclude: Vec<String>,
    /// Never pull images and always reuse existing containers
    #[arg(long)]
    pub fast: bool,
    /// Ignore only_if conditions
    #[arg(long)]
    pub skip_only_if: bool,
}

#[derive(Args, Debug, Default)]
pub struct DownArgs {
    /// Services to stop (default: every container of the project)
    pub services: Vec<String>,
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct RmArgs {
    /// Services to remove together with their data (default: all)
    pub services: Vec<String>,
    #[arg(long)]
    pub project: Option<String>,
    /// Do not ask for confirmation
    #[arg(long, short = 'y', env = "DEVSERVICES_YES")]
    pub yes: bool,
}

#[derive(Args, Debug, Default)]
pub struct AttachArgs {
    /// Service to run in the foreground
    pub service: String,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub fast: bool,
}

/// Resolves the configured service table and drives the orchestrator.
pub struct Devservices {
    config: AppConfig,
    host: HostFacts,
    orchestrator: Orchestrator,
}

impl Devservices {
    pub fn new(config_dir: &Path) -> Result<Self> {
        let config = load_app_config(config_dir)?;
        let runtime = Arc::new(DockerAdapter::new(config.binary()));
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn with_runtime(config: AppConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let container_service = Arc::new(ContainerService::new(Arc::clone(&runtime)));
        let system_service = Arc::new(SystemService::new(runtime));
        let orchestrator = Orchestrator::new(container_service, system_service)
            .with_daemon_wait(config.startup_timeout(), DAEMON_POLL_INTERVAL);

        Self {
            config,
            host: HostFacts::current(),
            orchestrator,
        }
    }

    /// Evaluates only_if conditions against `host` instead of this machine.
    pub fn with_host(mut self, host: HostFacts) -> Self {
        self.host = host;
        self
    }

    fn project(&self, flag: Option<&str>) -> String {
        flag.unwrap_or(self.config.project_name()).to_string()
    }

    fn table(&self, project: &str, skip_only_if: bool) -> Result<ServiceTable> {
        resolve(&self.config, project, &self.host, skip_only_if)
    }

    pub fn up(&self, args: &UpArgs) -> Result<()> {
        let project = self.project(args.project.as_deref());
        // Naming a service explicitly brings it up regardless of only_if
        let skip_only_if = args.skip_only_if || !args.services.is_empty();
        let table = self.table(&project, skip_only_if)?;

        self.orchestrator
            .up(&project, &table, &args.services, &args.exclude, args.fast)?;
        info!("Services are up");
        Ok(())
    }

    pub fn down(&self, args: &DownArgs) -> Result<()> {
        let project = self.project(args.project.as_deref());
        let table = self.table(&project, true)?;
        self.orchestrator.down(&project, &table, &args.services)
    }

    /// Removes services and their data once `confirm` agrees to the list.
    pub fn rm<F>(&self, args: &RmArgs, confirm: F) -> Result<()>
    where
        F: FnOnce(&[String]) -> Result<bool>,
    {
        let project = self.project(args.project.as_deref());
        let enabled = self.table(&project, false)?;
        let selected = Orchestrator::select_for_removal(&enabled, &args.services)?;

        if !args.yes && !confirm(&selected)? {
            info!("Aborted");
            return Ok(());
        }

        // Services gated off by only_if may still run after `up <name>`
        let all = self.table(&project, true)?;
        self.orchestrator.rm(&project, &all, &selected)
    }

    pub fn attach(&self, args: &AttachArgs) -> Result<AttachedService> {
        let project = self.project(args.project.as_deref());
        let table = self.table(&project, false)?;
        self.orchestrator
            .attach(&project, &table, &args.service, args.fast)
    }
}

/// Interactive confirmation for `rm`.
pub fn confirm_removal(services: &[String]) -> Result<bool> {
    println!("The following services will be removed along with their data:");
    for service in services {
        println!("  - {service}");
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt("Continue?")
        .default(false)
        .interact()?;
    Ok(confirmed)
}

/// Follows the attached container's output until the user interrupts,
/// then stops and removes the container.
pub fn run_attached(attached: AttachedService) -> Result<()> {
    let attached = Arc::new(attached);

    {
        let attached = Arc::clone(&attached);
        ctrlc::set_handler(move || {
            if let Err(e) = attached.interrupt() {
                error!("Failed to stop {}: {e:#}", attached.service());
            }
        })
        .context("installing signal handler")?;
    }

    info!(
        "Attached to {} ({}). Press Ctrl+C to stop it.",
        attached.service(),
        attached.container().name
    );
    attached.run()
}
