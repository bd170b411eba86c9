use serde::Deserialize;
use std::collections::BTreeMap;

/// Loopback interface used when a port mapping names no host interface.
pub const DEFAULT_INTERFACE: &str = "127.0.0.1";

/// Restart policy applied when a service does not set one.
///
/// `unless-stopped` keeps containers from several projects from all coming
/// back (and fighting over ports) when the machine boots.
pub const DEFAULT_RESTART_POLICY: &str = "unless-stopped";

/// Free-form values from the `[settings]` table, consulted by `only_if`.
pub type Settings = BTreeMap<String, toml::Value>;

/// A backing service as declared in `devservices.toml` under `[services.NAME]`.
///
/// The name is the table key and is carried separately.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub image: String,
    /// Container port (`"5432"`, `"5432/tcp"`) to host binding.
    #[serde(default)]
    pub ports: BTreeMap<String, PortSpec>,
    /// Mount source to target. Sources without `/` are named volumes.
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeSpec>,
    /// Values may hold `{containers.<service>.<field>}` placeholders.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    /// Pull the image on every `up`, recreating the container afterwards.
    #[serde(default)]
    pub pull: bool,
    /// Started on demand by `attach` only, never by `up`.
    #[serde(default)]
    pub with_devserver: bool,
    #[serde(default)]
    pub only_if: OnlyIf,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl ServiceDefinition {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ports: BTreeMap::new(),
            volumes: BTreeMap::new(),
            environment: BTreeMap::new(),
            restart_policy: None,
            pull: false,
            with_devserver: false,
            only_if: OnlyIf::default(),
            command: Vec::new(),
            entrypoint: None,
        }
    }
}

/// Host side of a port mapping as written by the user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortSpec {
    /// `5432`
    Port(u16),
    /// `["0.0.0.0", 5432]`
    Bound(String, u16),
}

impl PortSpec {
    /// Every binding gets an explicit interface, loopback unless one was given.
    pub fn normalize(&self) -> HostBinding {
        match self {
            PortSpec::Port(port) => HostBinding::new(DEFAULT_INTERFACE, *port),
            PortSpec::Bound(interface, port) => HostBinding::new(interface.clone(), *port),
        }
    }
}

/// Explicit `(interface, port)` pair on the host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostBinding {
    pub interface: String,
    pub port: u16,
}

impl HostBinding {
    pub fn new(interface: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            port,
        }
    }
}

impl std::fmt::Display for HostBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.interface, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VolumeSpec {
    /// `postgres = "/var/lib/postgresql/data"`
    Target(String),
    /// `postgres = { bind = "/var/lib/postgresql/data", mode = "rw" }`
    Mount {
        bind: String,
        #[serde(default)]
        mode: Option<String>,
    },
}

impl VolumeSpec {
    pub fn to_mount(&self) -> Mount {
        match self {
            VolumeSpec::Target(bind) => Mount {
                bind: bind.clone(),
                mode: None,
            },
            VolumeSpec::Mount { bind, mode } => Mount {
                bind: bind.clone(),
                mode: mode.clone(),
            },
        }
    }
}

/// Container side of a volume mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub bind: String,
    pub mode: Option<String>,
}

/// True when a mount source names a volume rather than a host path.
pub fn is_named_volume(source: &str) -> bool {
    !source.contains('/')
}

/// Facts about the machine that `only_if` conditions can test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub os: String,
    pub arch: String,
}

impl HostFacts {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

/// Predicate deciding whether a service is part of the table at all.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OnlyIf {
    Always(bool),
    When(Condition),
}

impl Default for OnlyIf {
    fn default() -> Self {
        OnlyIf::Always(true)
    }
}

/// Every clause that is present must hold.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(default)]
    pub os: Option<Vec<String>>,
    #[serde(default)]
    pub arch: Option<Vec<String>>,
    #[serde(default)]
    pub setting: Option<String>,
}

impl OnlyIf {
    pub fn holds(&self, host: &HostFacts, settings: &Settings) -> bool {
        match self {
            OnlyIf::Always(value) => *value,
            OnlyIf::When(condition) => condition.holds(host, settings),
        }
    }
}

impl Condition {
    fn holds(&self, host: &HostFacts, settings: &Settings) -> bool {
        if let Some(os) = &self.os {
            if !os.iter().any(|o| o == &host.os) {
                return false;
            }
        }
        if let Some(arch) = &self.arch {
            if !arch.iter().any(|a| a == &host.arch) {
                return false;
            }
        }
        if let Some(key) = &self.setting {
            return settings.get(key).is_some_and(is_truthy);
        }
        true
    }
}

fn is_truthy(value: &toml::Value) -> bool {
    match value {
        toml::Value::Boolean(b) => *b,
        toml::Value::Integer(i) => *i != 0,
        toml::Value::Float(f) => *f != 0.0,
        toml::Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        toml::Value::Array(a) => !a.is_empty(),
        toml::Value::Table(t) => !t.is_empty(),
        toml::Value::Datetime(_) => true,
    }
}
