use crate::domain::{Container, ContainerRuntime, ContainerState, LaunchOptions, RuntimeError};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BINARY: &str = "docker";

/// Docker Desktop for Mac sometimes leaves the regular socket broken while
/// the raw one keeps working (docker/for-mac#5025).
pub const RAW_SOCKET_HACK_PATH: &str =
    "~/Library/Containers/com.docker.docker/Data/docker.raw.sock";

const DOCKER_APP: &str = "/Applications/Docker.app";

/// Drives the runtime through its command-line client (`docker`, or a
/// compatible one such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerAdapter {
    binary: String,
    host: Option<String>,
}

impl DockerAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        let host = docker_host_override(
            std::env::var("DOCKER_HOST").ok().as_deref(),
            &raw_socket_path(),
        );
        if let Some(host) = &host {
            debug!("Using DOCKER_HOST={host}");
        }
        Self {
            binary: binary.into(),
            host,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }

    fn output<I, S>(&self, args: I, context: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("{context} (running {})", self.binary))
    }

    /// Runs the client and returns its stdout, failing on a non-zero exit.
    fn checked<I, S>(&self, args: I, context: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args, context)?;
        if !output.status.success() {
            return Err(RuntimeError::api(context, stderr_of(&output)).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runs an inspect-style command: success means present, "no such" means absent.
    fn exists<I, S>(&self, args: I, context: &str) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args, context)?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = stderr_of(&output);
        if is_not_found(&stderr) {
            return Ok(false);
        }

        Err(RuntimeError::api(context, stderr).into())
    }
}

impl Default for DockerAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl ContainerRuntime for DockerAdapter {
    fn ping(&self) -> Result<()> {
        self.checked(["version", "--format", "{{.Server.Version}}"], "pinging daemon")
            .map(|_| ())
    }

    fn start_daemon(&self) -> Result<()> {
        if !cfg!(target_os = "macos") {
            bail!("Unable to start docker. Make sure docker is running.");
        }

        let status = Command::new("open")
            .args(["-a", DOCKER_APP, "--args", "--unattended"])
            .status()
            .with_context(|| format!("opening {DOCKER_APP}"))?;

        if !status.success() {
            bail!("open returned status {:?} ({DOCKER_APP})", status);
        }
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        self.exists(
            ["image", "inspect", image],
            &format!("checking image {image}"),
        )
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        self.checked(["pull", image], &format!("pulling image {image}"))
            .map(|_| ())
    }

    fn get_container(&self, name: &str) -> Result<Option<Container>> {
        let context = format!("inspecting container {name}");
        let output = self.output(
            [
                "container",
                "inspect",
                "--format",
                "{{.Id}}\t{{.State.Running}}",
                name,
            ],
            &context,
        )?;

        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(RuntimeError::api(context, stderr).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (id, running) = stdout
            .trim()
            .split_once('\t')
            .with_context(|| format!("unexpected inspect output for {name}: {stdout:?}"))?;
        let state = if running == "true" {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        };

        Ok(Some(Container::new(id, name, state)))
    }

    fn list_containers(&self) -> Result<Vec<Container>> {
        let stdout = self.checked(
            ["ps", "--all", "--no-trunc", "--format", "{{json .}}"],
            "listing containers",
        )?;
        parse_ps_lines(&stdout)
    }

    fn create_container(&self, options: &LaunchOptions) -> Result<Container> {
        let id = self.checked(
            create_args(options),
            &format!("creating container {}", options.name),
        )?;
        Ok(Container::new(id, &options.name, ContainerState::Stopped))
    }

    fn start_container(&self, name: &str) -> Result<()> {
        self.checked(["start", name], &format!("starting container {name}"))
            .map(|_| ())
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        self.checked(["stop", name], &format!("stopping container {name}"))
            .map(|_| ())
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.checked(["rm", name], &format!("removing container {name}"))
            .map(|_| ())
    }

    fn stream_logs(&self, name: &str, since: Duration) -> Result<()> {
        let since = format!("{}s", since.as_secs());
        let status = self
            .command()
            .args(["logs", "--follow", "--since", &since, name])
            .status()
            .with_context(|| format!("following logs of {name}"))?;

        if !status.success() && !ended_by_signal(status) {
            bail!("logs of {name} ended with status {:?}", status);
        }
        Ok(())
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            ["network", "inspect", name],
            &format!("checking network {name}"),
        )
    }

    fn create_network(&self, name: &str) -> Result<()> {
        self.checked(
            ["network", "create", name],
            &format!("creating network {name}"),
        )
        .map(|_| ())
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.checked(["network", "rm", name], &format!("removing network {name}"))
            .map(|_| ())
    }

    fn volume_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            ["volume", "inspect", name],
            &format!("checking volume {name}"),
        )
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        self.checked(["volume", "create", name], &format!("creating volume {name}"))
            .map(|_| ())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.checked(["volume", "rm", name], &format!("removing volume {name}"))
            .map(|_| ())
    }

    fn list_volumes(&self) -> Result<Vec<String>> {
        let stdout = self.checked(["volume", "ls", "--format", "{{.Name}}"], "listing volumes")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// `DOCKER_HOST` to force on the client, if any. An explicit setting always wins.
pub fn docker_host_override(current: Option<&str>, raw_socket: &Path) -> Option<String> {
    if current.is_some() {
        return None;
    }
    raw_socket
        .exists()
        .then(|| format!("unix://{}", raw_socket.display()))
}

/// The client got the same SIGINT/SIGTERM as we did.
#[cfg(unix)]
fn ended_by_signal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some() || matches!(status.code(), Some(130 | 143))
}

#[cfg(not(unix))]
fn ended_by_signal(_status: ExitStatus) -> bool {
    false
}

fn raw_socket_path() -> PathBuf {
    PathBuf::from(shellexpand::tilde(RAW_SOCKET_HACK_PATH).as_ref())
}

fn create_args(options: &LaunchOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        options.name.clone(),
        "--network".into(),
        options.network.clone(),
        "--restart".into(),
        options.restart_policy.clone(),
    ];

    if !options.detach {
        for stream in ["stdout", "stderr"] {
            args.push("--attach".into());
            args.push(stream.into());
        }
    }

    for (container_port, binding) in &options.ports {
        args.push("-p".into());
        args.push(format!("{binding}:{container_port}"));
    }

    for (key, value) in &options.environment {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    for (source, mount) in &options.volumes {
        args.push("-v".into());
        match &mount.mode {
            Some(mode) => args.push(format!("{source}:{}:{mode}", mount.bind)),
            None => args.push(format!("{source}:{}", mount.bind)),
        }
    }

    if let Some(entrypoint) = &options.entrypoint {
        args.push("--entrypoint".into());
        args.push(entrypoint.clone());
    }

    args.push(options.image.clone());
    args.extend(options.command.iter().cloned());
    args
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID", alias = "Id")]
    id: String,
    #[serde(rename = "Names")]
    names: PsNames,
    #[serde(rename = "State")]
    state: String,
}

/// Docker prints a comma separated string, podman a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum PsNames {
    Joined(String),
    List(Vec<String>),
}

impl PsNames {
    fn first(&self) -> Option<&str> {
        match self {
            PsNames::Joined(names) => names.split(',').next(),
            PsNames::List(names) => names.first().map(String::as_str),
        }
    }
}

fn parse_ps_lines(stdout: &str) -> Result<Vec<Container>> {
    let mut containers = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let ps: PsLine =
            serde_json::from_str(line).with_context(|| format!("parsing ps output {line:?}"))?;
        let Some(name) = ps.names.first() else {
            continue;
        };
        let state = if ps.state.eq_ignore_ascii_case("running") {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        };
        containers.push(Container::new(ps.id, name.trim_start_matches('/'), state));
    }

    Ok(containers)
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HostBinding, Mount};
    use std::collections::BTreeMap;

    fn options() -> LaunchOptions {
        LaunchOptions {
            service: "postgres".into(),
            name: "sentry_postgres".into(),
            project: "sentry".into(),
            image: "postgres:14".into(),
            network: "sentry".into(),
            detach: true,
            ports: BTreeMap::from([("5432/tcp".to_string(), HostBinding::new("127.0.0.1", 5432))]),
            volumes: BTreeMap::from([(
                "sentry_postgres".to_string(),
                Mount {
                    bind: "/var/lib/postgresql/data".into(),
                    mode: None,
                },
            )]),
            environment: BTreeMap::from([(
                "POSTGRES_HOST_AUTH_METHOD".to_string(),
                "trust".to_string(),
            )]),
            restart_policy: "unless-stopped".into(),
            pull: false,
            with_devserver: false,
            command: vec!["postgres".into(), "-c".into(), "fsync=off".into()],
            entrypoint: None,
        }
    }

    #[test]
    fn builds_create_arguments() {
        let args = create_args(&options());
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "sentry_postgres",
                "--network",
                "sentry",
                "--restart",
                "unless-stopped",
                "-p",
                "127.0.0.1:5432:5432/tcp",
                "-e",
                "POSTGRES_HOST_AUTH_METHOD=trust",
                "-v",
                "sentry_postgres:/var/lib/postgresql/data",
                "postgres:14",
                "postgres",
                "-c",
                "fsync=off",
            ]
        );
    }

    #[test]
    fn volume_mode_and_entrypoint_are_passed() {
        let mut opts = options();
        opts.volumes.insert(
            "/home/dev/init".into(),
            Mount {
                bind: "/init".into(),
                mode: Some("ro".into()),
            },
        );
        opts.entrypoint = Some("/bin/sh".into());
        let args = create_args(&opts);

        assert!(args.contains(&"/home/dev/init:/init:ro".to_string()));
        let pos = args.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(args[pos + 1], "/bin/sh");
        assert!(pos < args.iter().position(|a| a == "postgres:14").unwrap());
    }

    #[test]
    fn parses_docker_ps_json() {
        let stdout = r#"
{"Command":"\"docker-entrypoint.s…\"","ID":"abc123","Names":"sentry_postgres","State":"running"}
{"Command":"\"redis-server\"","ID":"def456","Names":"sentry_redis,alias","State":"exited"}
"#;
        let containers = parse_ps_lines(stdout).unwrap();
        assert_eq!(
            containers,
            vec![
                Container::new("abc123", "sentry_postgres", ContainerState::Running),
                Container::new("def456", "sentry_redis", ContainerState::Stopped),
            ]
        );
    }

    #[test]
    fn parses_podman_ps_json() {
        let stdout = r#"{"Id":"abc","Names":["sentry_kafka"],"State":"running"}"#;
        let containers = parse_ps_lines(stdout).unwrap();
        assert_eq!(containers[0].name, "sentry_kafka");
        assert!(containers[0].is_running());
    }

    #[test]
    fn recognizes_not_found_messages() {
        assert!(is_not_found("Error: No such container: sentry_redis"));
        assert!(is_not_found(
            "Error response from daemon: network sentry not found"
        ));
        assert!(!is_not_found("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn explicit_docker_host_wins() {
        let temp = tempfile::tempdir().unwrap();
        let socket = temp.path().join("docker.raw.sock");
        std::fs::write(&socket, "").unwrap();

        assert_eq!(docker_host_override(Some("tcp://remote:2375"), &socket), None);
        assert_eq!(
            docker_host_override(None, &socket),
            Some(format!("unix://{}", socket.display()))
        );
        assert_eq!(
            docker_host_override(None, &temp.path().join("missing.sock")),
            None
        );
    }

    #[cfg(unix)]
    #[test]
    fn log_client_killed_by_interrupt_is_not_a_failure() {
        use std::os::unix::process::ExitStatusExt;

        assert!(ended_by_signal(ExitStatus::from_raw(2)));
        assert!(ended_by_signal(ExitStatus::from_raw(130 << 8)));
        assert!(!ended_by_signal(ExitStatus::from_raw(1 << 8)));
    }
}
