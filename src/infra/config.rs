use crate::domain::{ConfigError, ServiceDefinition, Settings};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_NAME: &str = "devservices.toml";
pub const DEFAULT_PROJECT: &str = "sentry";
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../config/default_devservices.toml");

pub fn default_config_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config/devservices")
}

pub fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    fs::create_dir_all(config_dir).with_context(|| format!("creating {:?}", config_dir))
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProjectConfig {
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RuntimeConfig {
    /// Client binary (`docker`, `podman`, ...)
    pub binary: Option<String>,
    /// Seconds to wait for the daemon after trying to start it
    pub startup_timeout: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Values that `only_if = { setting = "..." }` can test
    #[serde(default)]
    pub settings: Settings,
    /// Services defined inline as [services.NAME]
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
}

impl AppConfig {
    /// Merges another AppConfig into self.
    /// Values from `other` overwrite values in `self` if present.
    pub fn merge(&mut self, other: AppConfig) {
        if let Some(name) = other.project.name {
            self.project.name = Some(name);
        }
        if let Some(binary) = other.runtime.binary {
            self.runtime.binary = Some(binary);
        }
        if let Some(timeout) = other.runtime.startup_timeout {
            self.runtime.startup_timeout = Some(timeout);
        }
        self.settings.extend(other.settings);
        // Services with same name in 'other' replace the existing definition
        self.services.extend(other.services);
    }

    pub fn project_name(&self) -> &str {
        self.project.name.as_deref().unwrap_or(DEFAULT_PROJECT)
    }

    pub fn binary(&self) -> &str {
        self.runtime
            .binary
            .as_deref()
            .unwrap_or(crate::infra::docker_adapter::DEFAULT_BINARY)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(
            self.runtime
                .startup_timeout
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
        )
    }

    /// Checks names and images of every declared service
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            validate_service_name(name)?;
            if service.image.trim().is_empty() {
                return Err(ConfigError::MissingImage(name.clone()).into());
            }
        }
        Ok(())
    }
}

/// Container name restrictions apply, since names end up in `project_name`.
fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    let Some(first) = name.chars().next() else {
        return Err(ConfigError::EmptyServiceName);
    };
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyServiceName);
    }
    if !first.is_ascii_alphanumeric() {
        return Err(ConfigError::InvalidServiceName {
            name: name.to_string(),
            found: first,
        });
    }
    if let Some(found) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-'))
    {
        return Err(ConfigError::InvalidServiceName {
            name: name.to_string(),
            found,
        });
    }
    Ok(())
}

pub fn install_default_config(target_dir: &Path) -> Result<bool> {
    ensure_config_dir(target_dir)?;

    let target = target_dir.join(DEFAULT_CONFIG_NAME);
    if target.exists() {
        return Ok(false);
    }

    fs::write(&target, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("writing template to {:?}", target))?;
    Ok(true)
}

fn read_config(path: &Path) -> Result<Option<AppConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("parsing {:?}", path))?;
    debug!("Loaded {} service(s) from {:?}", config.services.len(), path);
    Ok(Some(config))
}

/// Global config from `config_dir`, then `./devservices.toml` merged on top.
pub fn load_app_config(config_dir: &Path) -> Result<AppConfig> {
    load_layered(&[
        config_dir.join(DEFAULT_CONFIG_NAME),
        PathBuf::from("./").join(DEFAULT_CONFIG_NAME),
    ])
}

/// Later files override earlier ones; missing files are skipped.
pub fn load_layered(paths: &[PathBuf]) -> Result<AppConfig> {
    let mut app_config = AppConfig::default();

    for path in paths {
        if let Some(layer) = read_config(path)? {
            app_config.merge(layer);
        }
    }

    app_config.validate()?;
    Ok(app_config)
}
