//! Turns the declarative service table into resolved launch options.
//!
//! Resolution is pure: configuration, project and host facts come in as
//! arguments and nothing is read from the process environment. Environment
//! values are interpolated in a second pass over the finished phase-one
//! table, so a service may reference any other service regardless of order.

use crate::domain::service::DEFAULT_RESTART_POLICY;
use crate::domain::{ConfigError, HostFacts, LaunchOptions, ServiceDefinition, scoped_name};
use crate::infra::config::AppConfig;
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::debug;

/// Service name to resolved launch options, in name order.
pub type ServiceTable = BTreeMap<String, LaunchOptions>;

pub fn resolve(
    config: &AppConfig,
    project: &str,
    host: &HostFacts,
    skip_only_if: bool,
) -> Result<ServiceTable> {
    let mut table = ServiceTable::new();

    for (name, definition) in &config.services {
        if !skip_only_if && !definition.only_if.holds(host, &config.settings) {
            debug!("Skipping {name} due to only_if condition");
            continue;
        }
        table.insert(name.clone(), launch_options(name, definition, project));
    }

    let interpolated = table
        .iter()
        .map(|(name, options)| {
            let environment = options
                .environment
                .iter()
                .map(|(key, value)| {
                    interpolate(value, &table)
                        .map(|v| (key.clone(), v))
                        .map_err(|reason| ConfigError::Interpolation {
                            service: name.clone(),
                            variable: key.clone(),
                            reason,
                        })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;

            Ok((
                name.clone(),
                LaunchOptions {
                    environment,
                    ..options.clone()
                },
            ))
        })
        .collect::<Result<ServiceTable, ConfigError>>()?;

    Ok(interpolated)
}

fn launch_options(name: &str, definition: &ServiceDefinition, project: &str) -> LaunchOptions {
    LaunchOptions {
        service: name.to_string(),
        name: scoped_name(project, name),
        project: project.to_string(),
        image: definition.image.clone(),
        network: project.to_string(),
        detach: true,
        ports: definition
            .ports
            .iter()
            .map(|(port, spec)| (port.clone(), spec.normalize()))
            .collect(),
        volumes: definition
            .volumes
            .iter()
            .map(|(source, spec)| (source.clone(), spec.to_mount()))
            .collect(),
        environment: definition.environment.clone(),
        restart_policy: definition
            .restart_policy
            .clone()
            .unwrap_or_else(|| DEFAULT_RESTART_POLICY.to_string()),
        pull: definition.pull,
        with_devserver: definition.with_devserver,
        command: definition.command.clone(),
        entrypoint: definition.entrypoint.clone(),
    }
}

/// Expands `{containers.<service>.<field>}`; `{{` and `}}` are literal braces.
fn interpolate(template: &str, table: &ServiceTable) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if tail.starts_with('{') {
            let end = tail
                .find('}')
                .ok_or_else(|| "unterminated placeholder".to_string())?;
            out.push_str(&lookup(&tail[1..end], table)?);
            rest = &tail[end + 1..];
        } else {
            return Err("unmatched '}'".to_string());
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup(expr: &str, table: &ServiceTable) -> Result<String, String> {
    let mut parts = expr.splitn(4, '.');
    let (Some("containers"), Some(service), Some(field)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("unsupported placeholder '{{{expr}}}'"));
    };
    let arg = parts.next();

    let options = table
        .get(service)
        .ok_or_else(|| format!("unknown service '{service}'"))?;

    let value = match (field, arg) {
        ("name", None) => Some(options.name.clone()),
        ("image", None) => Some(options.image.clone()),
        ("network", None) => Some(options.network.clone()),
        ("environment", Some(key)) => options.environment.get(key).cloned(),
        ("ports", Some(port)) => options.ports.get(port).map(|b| b.port.to_string()),
        ("addresses", Some(port)) => options.ports.get(port).map(ToString::to_string),
        _ => return Err(format!("unknown field '{field}' in '{{{expr}}}'")),
    };

    value.ok_or_else(|| format!("'{{{expr}}}' is not defined"))
}
