//! Translation from a [`ServiceConfig`] to the engine create payload.
//!
//! Pure data mapping: ports are parsed, the effective environment is
//! assembled (env_file layers under the inline mapping), resource limits
//! and ulimits are flattened, and the owned label set is stamped on.
//! References to other services (links, volumes_from, namespace modes)
//! arrive here already resolved to engine-level names by the service
//! runtime.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::interpolation::EnvironmentLookup;
use crate::config::validation::PortSpec;
use crate::config::{env_loader, ServiceConfig};
use crate::engine::{
    CreateSpec, HostSpec, PortBinding, RestartPolicySpec, UlimitSpec,
};
use crate::error::{Error, Result};

/// Cross-service inputs the converter cannot derive from the config alone.
pub struct ConvertInputs<'a> {
    pub project: &'a str,
    /// Directory `env_file` paths resolve against.
    pub base_dir: &'a Path,
    pub lookup: &'a dyn EnvironmentLookup,
    /// Owned labels for this container (project/service/hash/number/...).
    pub labels: BTreeMap<String, String>,
    /// Engine-level `container:alias` link pairs, already resolved.
    pub links: Vec<String>,
    /// `volumes_from` resolved to container names.
    pub volumes_from: Vec<String>,
    /// `network_mode` with any `service:` reference resolved.
    pub network_mode: Option<String>,
    /// `ipc` with any `service:` reference resolved.
    pub ipc_mode: Option<String>,
}

/// Build the engine create payload for one container of a service.
pub fn create_spec(config: &ServiceConfig, inputs: ConvertInputs<'_>) -> Result<CreateSpec> {
    let mut exposed_ports = Vec::new();
    let mut port_bindings = Vec::new();

    for spec in &config.ports {
        let parsed = PortSpec::parse(spec)
            .map_err(|e| Error::InvalidManifest(format!("services.{}.ports: {e}", config.name)))?;
        exposed_ports.push(format!("{}/{}", parsed.container_port, parsed.protocol));
        port_bindings.push(PortBinding {
            host_ip: parsed.host_ip,
            host_port: parsed.host_port,
            container_port: parsed.container_port,
            protocol: parsed.protocol,
        });
    }
    for spec in &config.expose {
        let (port, protocol) = crate::config::validation::parse_expose_spec(spec)
            .map_err(|e| Error::InvalidManifest(format!("services.{}.expose: {e}", config.name)))?;
        let entry = format!("{port}/{protocol}");
        if !exposed_ports.contains(&entry) {
            exposed_ports.push(entry);
        }
    }

    let from_files = if config.env_file.is_empty() {
        Default::default()
    } else {
        env_loader::load_env_files(&config.env_file.0, inputs.base_dir)?
    };
    let env = env_loader::effective_environment(
        &config.environment,
        from_files,
        inputs.lookup,
        &config.name,
    );

    // User labels first, owned labels on top so they cannot be overridden.
    let mut labels = config.labels.0.clone();
    labels.extend(inputs.labels);

    let ulimits = config
        .ulimits
        .iter()
        .map(|(name, limit)| UlimitSpec {
            name: name.clone(),
            soft: limit.soft,
            hard: limit.hard,
        })
        .collect();

    let restart_policy = config.restart.as_ref().map(|policy| {
        use crate::config::RestartPolicy::*;
        match policy {
            No => RestartPolicySpec {
                name: "no".to_string(),
                max_retries: 0,
            },
            Always => RestartPolicySpec {
                name: "always".to_string(),
                max_retries: 0,
            },
            UnlessStopped => RestartPolicySpec {
                name: "unless-stopped".to_string(),
                max_retries: 0,
            },
            OnFailure { max_retries } => RestartPolicySpec {
                name: "on-failure".to_string(),
                max_retries: max_retries.unwrap_or(0),
            },
        }
    });

    let (log_driver, log_options) = match &config.logging {
        Some(logging) => (logging.driver.clone(), logging.options.0.clone()),
        None => (None, BTreeMap::new()),
    };

    let host = HostSpec {
        binds: config.volumes.clone(),
        volumes_from: inputs.volumes_from,
        volume_driver: config.volume_driver.clone(),
        tmpfs: config.tmpfs.0.clone(),
        port_bindings,
        links: {
            let mut links = inputs.links;
            links.extend(config.external_links.iter().cloned());
            links
        },
        network_mode: inputs.network_mode,
        ipc_mode: inputs.ipc_mode,
        pid_mode: config.pid.clone(),
        uts_mode: config.uts.clone(),
        cgroup_parent: config.cgroup_parent.clone(),
        dns: config.dns.0.clone(),
        dns_search: config.dns_search.0.clone(),
        extra_hosts: config.extra_hosts.clone(),
        privileged: config.privileged,
        read_only: config.read_only,
        cap_add: config.cap_add.clone(),
        cap_drop: config.cap_drop.clone(),
        security_opt: config.security_opt.clone(),
        devices: config.devices.clone(),
        mem_limit: config.mem_limit.map(|m| m.0),
        memswap_limit: config.memswap_limit.map(|m| m.0),
        cpu_shares: config.cpu_shares,
        cpu_quota: config.cpu_quota,
        cpuset: config.cpuset.clone(),
        ulimits,
        restart_policy,
        log_driver,
        log_options,
    };

    Ok(CreateSpec {
        image: config.image_name(inputs.project),
        command: config.command.as_ref().map(|c| c.0.clone()),
        entrypoint: config.entrypoint.as_ref().map(|e| e.0.clone()),
        env,
        working_dir: config.working_dir.clone(),
        user: config.user.clone(),
        hostname: config.hostname.clone(),
        domainname: config.domainname.clone(),
        mac_address: config.mac_address.clone(),
        labels,
        exposed_ports,
        tty: config.tty,
        stdin_open: config.stdin_open,
        stop_signal: config.stop_signal.clone(),
        host,
    })
}
