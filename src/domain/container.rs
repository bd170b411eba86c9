use super::service::{HostBinding, Mount, is_named_volume};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

/// Runtime-side handle of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Fully resolved, project-scoped parameters for creating one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Logical service name (table key).
    pub service: String,
    /// `project + "_" + service`
    pub name: String,
    pub project: String,
    pub image: String,
    pub network: String,
    pub detach: bool,
    pub ports: BTreeMap<String, HostBinding>,
    pub volumes: BTreeMap<String, Mount>,
    pub environment: BTreeMap<String, String>,
    pub restart_policy: String,
    pub pull: bool,
    pub with_devserver: bool,
    pub command: Vec<String>,
    pub entrypoint: Option<String>,
}

impl LaunchOptions {
    /// Named volume sources as declared, without the project prefix.
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .keys()
            .map(String::as_str)
            .filter(|source| is_named_volume(source))
    }

    /// Copy with every named volume renamed to `project_<volume>`.
    pub fn with_scoped_volumes(&self) -> Self {
        let volumes = self
            .volumes
            .iter()
            .map(|(source, mount)| {
                let source = if is_named_volume(source) {
                    scoped_name(&self.project, source)
                } else {
                    source.clone()
                };
                (source, mount.clone())
            })
            .collect();

        Self {
            volumes,
            ..self.clone()
        }
    }

    /// `(listening: 127.0.0.1:5432, ...)`, or empty when nothing is published.
    pub fn listening(&self) -> String {
        if self.ports.is_empty() {
            return String::new();
        }
        let bindings: Vec<String> = self.ports.values().map(ToString::to_string).collect();
        format!("(listening: {})", bindings.join(", "))
    }
}

/// Name of a project-owned resource: `project_name`.
pub fn scoped_name(project: &str, name: &str) -> String {
    format!("{project}_{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LaunchOptions {
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "postgres".to_string(),
            Mount {
                bind: "/var/lib/postgresql/data".into(),
                mode: None,
            },
        );
        volumes.insert(
            "/home/dev/init".to_string(),
            Mount {
                bind: "/docker-entrypoint-initdb.d".into(),
                mode: Some("ro".into()),
            },
        );
        let mut ports = BTreeMap::new();
        ports.insert("5432/tcp".to_string(), HostBinding::new("127.0.0.1", 5432));

        LaunchOptions {
            service: "postgres".into(),
            name: "sentry_postgres".into(),
            project: "sentry".into(),
            image: "postgres:14".into(),
            network: "sentry".into(),
            detach: true,
            ports,
            volumes,
            environment: BTreeMap::new(),
            restart_policy: "unless-stopped".into(),
            pull: false,
            with_devserver: false,
            command: Vec::new(),
            entrypoint: None,
        }
    }

    #[test]
    fn scopes_only_named_volumes() {
        let scoped = options().with_scoped_volumes();
        let sources: Vec<&str> = scoped.volumes.keys().map(String::as_str).collect();
        assert_eq!(sources, vec!["/home/dev/init", "sentry_postgres"]);
    }

    #[test]
    fn lists_named_volumes() {
        let opts = options();
        assert_eq!(opts.named_volumes().collect::<Vec<_>>(), vec!["postgres"]);
    }

    #[test]
    fn listening_summary() {
        assert_eq!(options().listening(), "(listening: 127.0.0.1:5432)");

        let mut quiet = options();
        quiet.ports.clear();
        assert_eq!(quiet.listening(), "");
    }
}
