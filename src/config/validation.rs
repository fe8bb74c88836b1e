//! Structural validation of manifests.
//!
//! Two passes. `validate_raw` runs per file against the untyped tree right
//! after interpolation, bound to the detected version: it checks the
//! document layout and the format of fields that are easy to get wrong
//! (ports, expose, environment). `validate_manifest` runs once after
//! merging and enforces the cross-service invariants: name syntax, image/
//! build presence, and that every reference points at a declared service.
//!
//! Violations carry a pointer-style path (`services.web.ports[0]`) so the
//! failing manifest line is easy to find.

use serde_yaml::Value;

use super::types::{Manifest, ManifestVersion, ServiceConfig};
use crate::error::{Error, Result};

const TOP_LEVEL_KEYS: &[&str] = &["version", "services", "volumes", "networks"];

/// Check a service name against `[A-Za-z0-9._-]+`.
pub fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// A parsed `ports:` entry. Accepted spellings:
/// `80`, `80/udp`, `8080:80`, `127.0.0.1:8080:80`, `8080:80/tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortSpec {
    pub fn parse(spec: &str) -> std::result::Result<PortSpec, String> {
        let (addr, protocol) = match spec.split_once('/') {
            Some((addr, proto)) => {
                if proto != "tcp" && proto != "udp" {
                    return Err(format!("unknown protocol {proto:?}"));
                }
                (addr, proto.to_string())
            }
            None => (spec, "tcp".to_string()),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let parse_port = |s: &str| -> std::result::Result<u16, String> {
            s.parse::<u16>()
                .map_err(|_| format!("invalid port number {s:?}"))
        };

        match parts.as_slice() {
            [container] => Ok(PortSpec {
                host_ip: None,
                host_port: None,
                container_port: parse_port(container)?,
                protocol,
            }),
            [host, container] => Ok(PortSpec {
                host_ip: None,
                host_port: Some(parse_port(host)?),
                container_port: parse_port(container)?,
                protocol,
            }),
            [ip, host, container] => Ok(PortSpec {
                host_ip: Some((*ip).to_string()),
                host_port: if host.is_empty() {
                    None
                } else {
                    Some(parse_port(host)?)
                },
                container_port: parse_port(container)?,
                protocol,
            }),
            _ => Err(format!("malformed port mapping {spec:?}")),
        }
    }
}

/// An `expose:` entry: `port` or `port/protocol`, container side only.
pub fn parse_expose_spec(spec: &str) -> std::result::Result<(u16, String), String> {
    let (port, protocol) = match spec.split_once('/') {
        Some((port, proto)) => {
            if proto != "tcp" && proto != "udp" {
                return Err(format!("unknown protocol {proto:?}"));
            }
            (port, proto.to_string())
        }
        None => (spec, "tcp".to_string()),
    };
    port.parse::<u16>()
        .map(|p| (p, protocol))
        .map_err(|_| format!("invalid port number {port:?}"))
}

fn invalid(path: &str, reason: impl std::fmt::Display) -> Error {
    Error::InvalidManifest(format!("{path}: {reason}"))
}

/// Validate one raw document against its detected version.
pub fn validate_raw(doc: &Value, version: ManifestVersion) -> Result<()> {
    let root = doc
        .as_mapping()
        .ok_or_else(|| invalid("(root)", "manifest must be a mapping"))?;

    let services: &Value = if version.has_services_section() {
        for key in root.keys() {
            let key = key
                .as_str()
                .ok_or_else(|| invalid("(root)", "top-level keys must be strings"))?;
            if !TOP_LEVEL_KEYS.contains(&key) {
                return Err(invalid(key, "unknown top-level key"));
            }
        }
        for section in ["volumes", "networks"] {
            if let Some(value) = doc.get(section) {
                if !value.is_null() && !value.is_mapping() {
                    return Err(invalid(section, "must be a mapping"));
                }
            }
        }
        doc.get("services")
            .ok_or_else(|| invalid("services", "missing section"))?
    } else {
        doc
    };

    let services = services
        .as_mapping()
        .ok_or_else(|| invalid("services", "must be a mapping of service name to config"))?;

    for (name, body) in services {
        let name = name
            .as_str()
            .ok_or_else(|| invalid("services", "service names must be strings"))?;
        if !valid_service_name(name) {
            return Err(invalid(
                &format!("services.{name}"),
                "service names may only contain [A-Za-z0-9._-]",
            ));
        }
        validate_raw_service(name, body)?;
    }

    Ok(())
}

fn validate_raw_service(name: &str, body: &Value) -> Result<()> {
    let path = format!("services.{name}");
    if !body.is_mapping() {
        return Err(invalid(&path, "service config must be a mapping"));
    }

    if let Some(ports) = body.get("ports") {
        let seq = ports
            .as_sequence()
            .ok_or_else(|| invalid(&format!("{path}.ports"), "must be a list"))?;
        for (i, entry) in seq.iter().enumerate() {
            let entry_path = format!("{path}.ports[{i}]");
            let spec = scalar_string(entry)
                .ok_or_else(|| invalid(&entry_path, "must be a string or number"))?;
            PortSpec::parse(&spec).map_err(|e| invalid(&entry_path, e))?;
        }
    }

    if let Some(expose) = body.get("expose") {
        let seq = expose
            .as_sequence()
            .ok_or_else(|| invalid(&format!("{path}.expose"), "must be a list"))?;
        for (i, entry) in seq.iter().enumerate() {
            let entry_path = format!("{path}.expose[{i}]");
            let spec = scalar_string(entry)
                .ok_or_else(|| invalid(&entry_path, "must be a string or number"))?;
            parse_expose_spec(&spec).map_err(|e| invalid(&entry_path, e))?;
        }
    }

    if let Some(environment) = body.get("environment") {
        let env_path = format!("{path}.environment");
        match environment {
            Value::Mapping(_) => {}
            Value::Sequence(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    if entry.as_str().is_none() {
                        return Err(invalid(
                            &format!("{env_path}[{i}]"),
                            "list-form environment entries must be strings",
                        ));
                    }
                }
            }
            Value::Null => {}
            _ => {
                return Err(invalid(&env_path, "must be a mapping or a list of K=V strings"));
            }
        }
    }

    for key in ["image", "container_name", "user", "working_dir"] {
        if let Some(value) = body.get(key) {
            if !value.is_null() && value.as_str().is_none() {
                return Err(invalid(&format!("{path}.{key}"), "must be a string"));
            }
        }
    }

    Ok(())
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Post-merge invariants over the typed manifest.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    for (name, service) in &manifest.services {
        let path = format!("services.{name}");

        if !valid_service_name(name) {
            return Err(invalid(&path, "service names may only contain [A-Za-z0-9._-]"));
        }

        let has_image = service.image.as_deref().is_some_and(|i| !i.is_empty());
        if !has_image && !service.has_build() {
            return Err(invalid(&path, "one of `image` or `build` is required"));
        }

        validate_references(manifest, name, service)?;
    }
    Ok(())
}

fn validate_references(manifest: &Manifest, name: &str, service: &ServiceConfig) -> Result<()> {
    let exists = |target: &str| manifest.services.contains_key(target);
    let path = format!("services.{name}");

    for link in &service.links {
        let target = link.split(':').next().unwrap_or(link);
        if !exists(target) {
            return Err(invalid(
                &format!("{path}.links"),
                format!("linked service {target:?} is not declared"),
            ));
        }
    }

    for entry in &service.volumes_from {
        // `container:<name>` is an external reference and not checked here.
        if entry.starts_with("container:") {
            continue;
        }
        let target = entry.split(':').next().unwrap_or(entry);
        if !exists(target) {
            return Err(invalid(
                &format!("{path}.volumes_from"),
                format!("service {target:?} is not declared"),
            ));
        }
    }

    for dep in &service.depends_on {
        if !exists(dep) {
            return Err(invalid(
                &format!("{path}.depends_on"),
                format!("service {dep:?} is not declared"),
            ));
        }
    }

    if let Some(target) = service.network_mode.as_ref().and_then(|m| m.service_ref()) {
        if !exists(target) {
            return Err(invalid(
                &format!("{path}.network_mode"),
                format!("service {target:?} is not declared"),
            ));
        }
    }

    if let Some(target) = service.ipc.as_ref().and_then(|m| m.service_ref()) {
        if !exists(target) {
            return Err(invalid(
                &format!("{path}.ipc"),
                format!("service {target:?} is not declared"),
            ));
        }
    }

    for binding in &service.networks.0 {
        if !manifest.networks.contains_key(&binding.name) && binding.name != "default" {
            return Err(invalid(
                &format!("{path}.networks"),
                format!("network {:?} is not declared", binding.name),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ManifestVersion;

    fn raw(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn service_name_pattern() {
        assert!(valid_service_name("web"));
        assert!(valid_service_name("db.primary-1_a"));
        assert!(!valid_service_name(""));
        assert!(!valid_service_name("web app"));
        assert!(!valid_service_name("web/app"));
    }

    #[test]
    fn port_spec_forms() {
        assert_eq!(
            PortSpec::parse("80").unwrap(),
            PortSpec {
                host_ip: None,
                host_port: None,
                container_port: 80,
                protocol: "tcp".into()
            }
        );
        let full = PortSpec::parse("127.0.0.1:8080:80/udp").unwrap();
        assert_eq!(full.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(full.host_port, Some(8080));
        assert_eq!(full.container_port, 80);
        assert_eq!(full.protocol, "udp");

        assert!(PortSpec::parse("eighty").is_err());
        assert!(PortSpec::parse("80/sctp").is_err());
        assert!(PortSpec::parse("1:2:3:4").is_err());
    }

    #[test]
    fn raw_v2_requires_services_section() {
        let doc = raw("version: \"2\"\nvolumes: {}");
        let err = validate_raw(&doc, ManifestVersion::V2).unwrap_err();
        assert!(err.to_string().contains("services"));
    }

    #[test]
    fn raw_rejects_unknown_top_level_key() {
        let doc = raw("version: \"2\"\nservices: {}\nsecrets: {}");
        assert!(validate_raw(&doc, ManifestVersion::V2).is_err());
    }

    #[test]
    fn raw_v1_services_at_root() {
        let doc = raw("web:\n  image: busybox");
        validate_raw(&doc, ManifestVersion::V1).unwrap();
    }

    #[test]
    fn raw_flags_bad_port_with_path() {
        let doc = raw("web:\n  image: busybox\n  ports:\n    - \"80:eighty\"");
        let err = validate_raw(&doc, ManifestVersion::V1).unwrap_err();
        assert!(err.to_string().contains("services.web.ports[0]"), "{err}");
    }

    #[test]
    fn raw_rejects_bad_service_name() {
        let doc = raw("\"bad name\":\n  image: busybox");
        assert!(validate_raw(&doc, ManifestVersion::V1).is_err());
    }

    #[test]
    fn manifest_requires_image_or_build() {
        let mut manifest = Manifest::default();
        manifest.services.insert(
            "web".to_string(),
            ServiceConfig {
                name: "web".to_string(),
                ..ServiceConfig::default()
            },
        );
        let err = validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("`image` or `build`"));
    }

    #[test]
    fn manifest_checks_depends_on_references() {
        let mut manifest = Manifest::default();
        manifest.services.insert(
            "web".to_string(),
            ServiceConfig {
                name: "web".to_string(),
                image: Some("busybox".to_string()),
                depends_on: vec!["ghost".to_string()],
                ..ServiceConfig::default()
            },
        );
        let err = validate_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn manifest_allows_container_volumes_from() {
        let mut manifest = Manifest::default();
        manifest.services.insert(
            "web".to_string(),
            ServiceConfig {
                name: "web".to_string(),
                image: Some("busybox".to_string()),
                volumes_from: vec!["container:shared-data".to_string()],
                ..ServiceConfig::default()
            },
        );
        validate_manifest(&manifest).unwrap();
    }
}
