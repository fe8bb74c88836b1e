//! Deterministic service configuration fingerprint.
//!
//! The fingerprint is a SHA-1 digest over a canonical encoding of the
//! service config: field keys in sorted order, each written as `<key>:`
//! followed by the value. Scalars use their string form, lists their
//! elements separated by NUL, maps sorted `k=v` pairs separated by NUL.
//! Absent and empty fields are skipped, so adding a new optional field
//! later does not shift the hash of configs that never set it.
//!
//! Every container the runtime creates carries the fingerprint in its
//! `config-hash` label; a mismatch on a later pass marks the container out
//! of sync.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use crate::config::ServiceConfig;

enum Field {
    Scalar(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

fn write_field(hasher: &mut Sha1, key: &str, field: &Field) {
    hasher.update(key.as_bytes());
    hasher.update(b":");
    match field {
        Field::Scalar(value) => hasher.update(value.as_bytes()),
        Field::List(items) => {
            for item in items {
                hasher.update(item.as_bytes());
                hasher.update([0u8]);
            }
        }
        Field::Map(map) => {
            for (k, v) in map {
                hasher.update(k.as_bytes());
                hasher.update(b"=");
                hasher.update(v.as_bytes());
                hasher.update([0u8]);
            }
        }
    }
    hasher.update(b"\n");
}

/// Compute the fingerprint for a named service configuration.
pub fn service_fingerprint(name: &str, config: &ServiceConfig) -> String {
    let mut fields: Vec<(&str, Field)> = Vec::with_capacity(48);

    let scalar = |fields: &mut Vec<(&str, Field)>, key: &'static str, value: Option<String>| {
        if let Some(value) = value {
            if !value.is_empty() {
                fields.push((key, Field::Scalar(value)));
            }
        }
    };
    let list = |fields: &mut Vec<(&str, Field)>, key: &'static str, items: &[String]| {
        if !items.is_empty() {
            fields.push((key, Field::List(items.to_vec())));
        }
    };
    let flag = |fields: &mut Vec<(&str, Field)>, key: &'static str, value: bool| {
        if value {
            fields.push((key, Field::Scalar("true".to_string())));
        }
    };

    scalar(&mut fields, "image", config.image.clone());
    if let Some(build) = &config.build {
        scalar(&mut fields, "build_context", Some(build.context.clone()));
        scalar(&mut fields, "build_dockerfile", build.dockerfile.clone());
        if !build.args.is_empty() {
            fields.push(("build_args", Field::Map(build.args.0.clone())));
        }
    }

    if let Some(command) = &config.command {
        list(&mut fields, "command", &command.0);
    }
    if let Some(entrypoint) = &config.entrypoint {
        // An explicitly empty entrypoint clears the image default, which is
        // a real config difference; encode its presence.
        if entrypoint.is_empty() {
            fields.push(("entrypoint", Field::Scalar("<none>".to_string())));
        } else {
            list(&mut fields, "entrypoint", &entrypoint.0);
        }
    }

    scalar(&mut fields, "working_dir", config.working_dir.clone());
    scalar(&mut fields, "user", config.user.clone());
    scalar(&mut fields, "hostname", config.hostname.clone());
    scalar(&mut fields, "domainname", config.domainname.clone());
    scalar(&mut fields, "mac_address", config.mac_address.clone());
    scalar(&mut fields, "cgroup_parent", config.cgroup_parent.clone());

    if !config.environment.is_empty() {
        let env: BTreeMap<String, String> = config
            .environment
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect();
        fields.push(("environment", Field::Map(env)));
    }
    list(&mut fields, "env_file", &config.env_file.0);

    list(&mut fields, "ports", &config.ports);
    list(&mut fields, "expose", &config.expose);
    scalar(
        &mut fields,
        "network_mode",
        config.network_mode.as_ref().map(|m| m.0.clone()),
    );
    if !config.networks.is_empty() {
        let bindings: Vec<String> = config
            .networks
            .0
            .iter()
            .map(|b| {
                format!(
                    "{}|{}|{}|{}",
                    b.name,
                    b.aliases.join(","),
                    b.ipv4_address.as_deref().unwrap_or_default(),
                    b.ipv6_address.as_deref().unwrap_or_default()
                )
            })
            .collect();
        fields.push(("networks", Field::List(bindings)));
    }
    list(&mut fields, "links", &config.links);
    list(&mut fields, "external_links", &config.external_links);
    list(&mut fields, "extra_hosts", &config.extra_hosts);
    list(&mut fields, "dns", &config.dns.0);
    list(&mut fields, "dns_search", &config.dns_search.0);

    list(&mut fields, "volumes", &config.volumes);
    list(&mut fields, "volumes_from", &config.volumes_from);
    scalar(&mut fields, "volume_driver", config.volume_driver.clone());
    list(&mut fields, "tmpfs", &config.tmpfs.0);

    scalar(&mut fields, "ipc", config.ipc.as_ref().map(|m| m.0.clone()));
    scalar(&mut fields, "pid", config.pid.clone());
    scalar(&mut fields, "uts", config.uts.clone());

    scalar(&mut fields, "mem_limit", config.mem_limit.map(|m| m.0.to_string()));
    scalar(
        &mut fields,
        "memswap_limit",
        config.memswap_limit.map(|m| m.0.to_string()),
    );
    scalar(&mut fields, "cpu_shares", config.cpu_shares.map(|v| v.to_string()));
    scalar(&mut fields, "cpu_quota", config.cpu_quota.map(|v| v.to_string()));
    scalar(&mut fields, "cpuset", config.cpuset.clone());
    if !config.ulimits.is_empty() {
        let map: BTreeMap<String, String> = config
            .ulimits
            .iter()
            .map(|(k, u)| (k.clone(), format!("{}:{}", u.soft, u.hard)))
            .collect();
        fields.push(("ulimits", Field::Map(map)));
    }

    scalar(&mut fields, "restart", config.restart.as_ref().map(|r| r.to_string()));
    flag(&mut fields, "read_only", config.read_only);
    flag(&mut fields, "privileged", config.privileged);
    list(&mut fields, "cap_add", &config.cap_add);
    list(&mut fields, "cap_drop", &config.cap_drop);
    list(&mut fields, "security_opt", &config.security_opt);
    list(&mut fields, "devices", &config.devices);

    flag(&mut fields, "tty", config.tty);
    flag(&mut fields, "stdin_open", config.stdin_open);
    if !config.labels.is_empty() {
        fields.push(("labels", Field::Map(config.labels.0.clone())));
    }
    if let Some(logging) = &config.logging {
        scalar(&mut fields, "log_driver", logging.driver.clone());
        if !logging.options.is_empty() {
            fields.push(("log_options", Field::Map(logging.options.0.clone())));
        }
    }
    scalar(&mut fields, "stop_signal", config.stop_signal.clone());
    scalar(&mut fields, "container_name", config.container_name.clone());
    list(&mut fields, "depends_on", &config.depends_on);

    fields.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    for (key, field) in &fields {
        write_field(&mut hasher, key, field);
    }

    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
