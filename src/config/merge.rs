//! Service composition: `extends` inheritance, multi-file overlays and the
//! v1 compatibility lift.
//!
//! Inheritance and overlays share one composition operator,
//! [`merge_service`]: the child's fields win over the parent's, with
//! type-specific rules per field. A multi-file overlay is a left fold of
//! that operator, treating each successive file as a child of the
//! accumulated result.

use std::collections::{BTreeMap, HashSet};

use super::loader::{self, RawFile};
use super::shapes::{Environment, KeyValueMap, StringOrList};
use super::types::{LoggingConfig, Manifest, ServiceConfig};
use super::validation;
use crate::config::interpolation::EnvironmentLookup;
use crate::error::{Error, Result};

/// Locates manifest files referenced through `extends`.
pub trait FileResolver: Send + Sync {
    /// Returns the file's bytes plus a stable identity for the resolved
    /// path, used for cycle detection and for resolving nested references
    /// relative to the parent file.
    fn resolve(&self, file: &str, relative_to: Option<&str>) -> Result<(Vec<u8>, String)>;
}

/// Disk-backed resolver rooted at the directory of the first manifest.
pub struct DiskResolver {
    base_dir: std::path::PathBuf,
}

impl DiskResolver {
    pub fn new<P: Into<std::path::PathBuf>>(base_dir: P) -> Self {
        DiskResolver {
            base_dir: base_dir.into(),
        }
    }
}

impl FileResolver for DiskResolver {
    fn resolve(&self, file: &str, relative_to: Option<&str>) -> Result<(Vec<u8>, String)> {
        let base = match relative_to {
            Some(parent) => {
                let parent_path = std::path::Path::new(parent);
                parent_path
                    .parent()
                    .map(|d| d.to_path_buf())
                    .unwrap_or_else(|| self.base_dir.clone())
            }
            None => self.base_dir.clone(),
        };
        let path = base.join(file);
        let bytes = std::fs::read(&path)?;
        Ok((bytes, path.to_string_lossy().into_owned()))
    }
}

/// In-memory resolver for tests and embedded manifests.
#[derive(Default)]
pub struct MapResolver(pub BTreeMap<String, Vec<u8>>);

impl MapResolver {
    pub fn with_file(mut self, name: &str, content: &str) -> Self {
        self.0.insert(name.to_string(), content.as_bytes().to_vec());
        self
    }
}

impl FileResolver for MapResolver {
    fn resolve(&self, file: &str, _relative_to: Option<&str>) -> Result<(Vec<u8>, String)> {
        self.0
            .get(file)
            .map(|bytes| (bytes.clone(), file.to_string()))
            .ok_or_else(|| Error::InvalidManifest(format!("extends file not found: {file}")))
    }
}

/// Fold v1-only spellings into their v2 shapes. Harmless on v2 input.
pub fn lift_v1(service: &mut ServiceConfig) {
    if service.build.is_some() {
        if let Some(dockerfile) = service.dockerfile.take() {
            let build = service.build.as_mut().expect("checked above");
            if build.dockerfile.is_none() {
                build.dockerfile = Some(dockerfile);
            }
        }
    }

    if service.log_driver.is_some() || !service.log_opt.is_empty() {
        let driver = service.log_driver.take();
        let options = std::mem::take(&mut service.log_opt);
        let logging = service.logging.get_or_insert_with(LoggingConfig::default);
        if logging.driver.is_none() {
            logging.driver = driver;
        }
        for (k, v) in options.0 {
            logging.options.0.entry(k).or_insert(v);
        }
    }
}

fn concat_dedup(parent: &[String], child: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    parent
        .iter()
        .chain(child.iter())
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}

fn merge_environment(parent: &Environment, child: &Environment) -> Environment {
    let mut merged = parent.clone();
    merged.extend_from(child);
    merged
}

fn merge_kv(parent: &KeyValueMap, child: &KeyValueMap) -> KeyValueMap {
    let mut merged = parent.clone();
    merged.extend_from(child);
    merged
}

/// Compose a child service over a parent. Used both for `extends`
/// (parent = the extended service) and for overlays (parent = the
/// accumulated earlier files).
pub fn merge_service(parent: &ServiceConfig, child: &ServiceConfig) -> ServiceConfig {
    let mut merged = child.clone();
    merged.name = child.name.clone();

    // image and build are mutually exclusive: whichever the child declares
    // wins and clears the other; a child declaring neither inherits both.
    match (child.image.is_some(), child.build.is_some()) {
        (true, false) => merged.build = None,
        (false, true) => merged.image = None,
        (false, false) => {
            merged.image = parent.image.clone();
            merged.build = parent.build.clone();
        }
        (true, true) => {}
    }

    merged.command = child.command.clone().or_else(|| parent.command.clone());
    merged.entrypoint = child.entrypoint.clone().or_else(|| parent.entrypoint.clone());
    merged.working_dir = child.working_dir.clone().or_else(|| parent.working_dir.clone());
    merged.user = child.user.clone().or_else(|| parent.user.clone());
    merged.hostname = child.hostname.clone().or_else(|| parent.hostname.clone());
    merged.domainname = child.domainname.clone().or_else(|| parent.domainname.clone());
    merged.network_mode = child.network_mode.clone().or_else(|| parent.network_mode.clone());
    merged.mac_address = child.mac_address.clone().or_else(|| parent.mac_address.clone());
    merged.volume_driver = child.volume_driver.clone().or_else(|| parent.volume_driver.clone());
    merged.ipc = child.ipc.clone().or_else(|| parent.ipc.clone());
    merged.pid = child.pid.clone().or_else(|| parent.pid.clone());
    merged.uts = child.uts.clone().or_else(|| parent.uts.clone());
    merged.cgroup_parent = child.cgroup_parent.clone().or_else(|| parent.cgroup_parent.clone());
    merged.mem_limit = child.mem_limit.or(parent.mem_limit);
    merged.memswap_limit = child.memswap_limit.or(parent.memswap_limit);
    merged.cpu_shares = child.cpu_shares.or(parent.cpu_shares);
    merged.cpu_quota = child.cpu_quota.or(parent.cpu_quota);
    merged.cpuset = child.cpuset.clone().or_else(|| parent.cpuset.clone());
    merged.restart = child.restart.clone().or_else(|| parent.restart.clone());
    merged.stop_signal = child.stop_signal.clone().or_else(|| parent.stop_signal.clone());
    merged.container_name = child.container_name.clone().or_else(|| parent.container_name.clone());
    merged.read_only = child.read_only || parent.read_only;
    merged.privileged = child.privileged || parent.privileged;
    merged.tty = child.tty || parent.tty;
    merged.stdin_open = child.stdin_open || parent.stdin_open;

    merged.ports = concat_dedup(&parent.ports, &child.ports);
    merged.expose = concat_dedup(&parent.expose, &child.expose);
    merged.volumes = concat_dedup(&parent.volumes, &child.volumes);
    merged.volumes_from = concat_dedup(&parent.volumes_from, &child.volumes_from);
    merged.devices = concat_dedup(&parent.devices, &child.devices);
    merged.links = concat_dedup(&parent.links, &child.links);
    merged.external_links = concat_dedup(&parent.external_links, &child.external_links);
    merged.extra_hosts = concat_dedup(&parent.extra_hosts, &child.extra_hosts);
    merged.security_opt = concat_dedup(&parent.security_opt, &child.security_opt);
    merged.cap_add = concat_dedup(&parent.cap_add, &child.cap_add);
    merged.cap_drop = concat_dedup(&parent.cap_drop, &child.cap_drop);
    merged.dns = StringOrList(concat_dedup(&parent.dns.0, &child.dns.0));
    merged.dns_search = StringOrList(concat_dedup(&parent.dns_search.0, &child.dns_search.0));
    merged.env_file = StringOrList(concat_dedup(&parent.env_file.0, &child.env_file.0));
    merged.tmpfs = StringOrList(concat_dedup(&parent.tmpfs.0, &child.tmpfs.0));
    merged.depends_on = concat_dedup(&parent.depends_on, &child.depends_on);

    merged.environment = merge_environment(&parent.environment, &child.environment);
    merged.labels = merge_kv(&parent.labels, &child.labels);

    merged.logging = match (&parent.logging, &child.logging) {
        (Some(p), Some(c)) => Some(LoggingConfig {
            driver: c.driver.clone().or_else(|| p.driver.clone()),
            options: merge_kv(&p.options, &c.options),
        }),
        (Some(p), None) => Some(p.clone()),
        (None, c) => c.clone(),
    };

    let mut ulimits = parent.ulimits.clone();
    for (name, limit) in &child.ulimits {
        ulimits.insert(name.clone(), *limit);
    }
    merged.ulimits = ulimits;

    // Network bindings merge by name, the child's binding winning.
    let mut networks = parent.networks.clone();
    for binding in &child.networks.0 {
        match networks.0.iter_mut().find(|b| b.name == binding.name) {
            Some(existing) => *existing = binding.clone(),
            None => networks.0.push(binding.clone()),
        }
    }
    merged.networks = networks;

    merged.extends = None;
    merged
}

/// Resolve the `extends` chain of one service, recursing into other files
/// through the resolver. `visited` holds `file::service` identities for
/// cycle detection.
fn resolve_extends(
    service: &ServiceConfig,
    file: &RawFile,
    resolver: &dyn FileResolver,
    lookup: &dyn EnvironmentLookup,
    visited: &mut Vec<String>,
) -> Result<ServiceConfig> {
    let Some(extends) = service.extends.clone() else {
        return Ok(service.clone());
    };

    let identity = format!("{}::{}", file.id, service.name);
    if visited.contains(&identity) {
        let mut cycle: Vec<String> = visited
            .iter()
            .skip_while(|v| *v != &identity)
            .map(|v| v.split("::").nth(1).unwrap_or(v).to_string())
            .collect();
        cycle.push(service.name.clone());
        return Err(Error::InvalidManifest(format!(
            "cycle through extends: {}",
            cycle.join(" -> ")
        )));
    }
    visited.push(identity);

    let (parent_file, owns_file);
    match &extends.file {
        Some(path) => {
            let (bytes, resolved_id) = resolver.resolve(path, Some(&file.id))?;
            owns_file = loader::load_file(&bytes, &resolved_id, lookup)?;
            parent_file = &owns_file;
        }
        None => parent_file = file,
    }

    let parent = parent_file.services.get(&extends.service).ok_or_else(|| {
        Error::InvalidManifest(format!(
            "services.{}.extends: service {:?} not found in {}",
            service.name, extends.service, parent_file.id
        ))
    })?;

    let resolved_parent = resolve_extends(parent, parent_file, resolver, lookup, visited)?;
    visited.pop();

    Ok(merge_service(&resolved_parent, service))
}

/// Merge an ordered list of loaded files into the final manifest:
/// per-file v1 lift and extends resolution, then the left-fold overlay,
/// then the post-merge invariant checks.
pub fn merge_files(
    files: &[RawFile],
    resolver: &dyn FileResolver,
    lookup: &dyn EnvironmentLookup,
) -> Result<Manifest> {
    let mut manifest = Manifest {
        version: files.first().map(|f| f.version),
        ..Manifest::default()
    };

    for file in files {
        if let (Some(expected), version) = (manifest.version, file.version) {
            if version != expected {
                return Err(Error::InvalidManifest(format!(
                    "{}: version {} conflicts with {} from the first file",
                    file.id, version, expected
                )));
            }
        }

        for (name, service) in &file.services {
            let mut resolved =
                resolve_extends(service, file, resolver, lookup, &mut Vec::new())?;
            lift_v1(&mut resolved);

            let merged = match manifest.services.get(name) {
                Some(earlier) => merge_service(earlier, &resolved),
                None => resolved,
            };
            manifest.services.insert(name.clone(), merged);
        }

        for (name, volume) in &file.volumes {
            manifest.volumes.insert(name.clone(), volume.clone());
        }
        for (name, network) in &file.networks {
            manifest.networks.insert(name.clone(), network.clone());
        }
    }

    validation::validate_manifest(&manifest)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::interpolation::MapEnv;

    fn service(yaml: &str, name: &str) -> ServiceConfig {
        let mut svc: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        svc.name = name.to_string();
        svc
    }

    #[test]
    fn scalar_child_wins() {
        let parent = service("image: a\nworking_dir: /parent", "web");
        let child = service("image: b", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.image.as_deref(), Some("b"));
        assert_eq!(merged.working_dir.as_deref(), Some("/parent"));
    }

    #[test]
    fn lists_concat_and_dedup_left_wins() {
        let parent = service("image: a\nports: [\"80\", \"443\"]", "web");
        let child = service("image: a\nports: [\"443\", \"8080\"]", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.ports, vec!["80", "443", "8080"]);
    }

    #[test]
    fn maps_child_key_wins() {
        let parent = service("image: a\nenvironment: {A: parent, B: parent}", "web");
        let child = service("image: a\nenvironment: {B: child, C: child}", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.environment.get("A"), Some(&Some("parent".into())));
        assert_eq!(merged.environment.get("B"), Some(&Some("child".into())));
        assert_eq!(merged.environment.get("C"), Some(&Some("child".into())));
    }

    #[test]
    fn child_image_clears_parent_build() {
        let parent = service("build: .", "web");
        let child = service("image: nginx", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.image.as_deref(), Some("nginx"));
        assert!(merged.build.is_none());
    }

    #[test]
    fn child_build_clears_parent_image() {
        let parent = service("image: nginx", "web");
        let child = service("build: .", "web");
        let merged = merge_service(&parent, &child);
        assert!(merged.image.is_none());
        assert_eq!(merged.build.as_ref().unwrap().context, ".");
    }

    #[test]
    fn child_without_either_inherits() {
        let parent = service("image: nginx", "web");
        let child = service("environment: {A: \"1\"}", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.image.as_deref(), Some("nginx"));
    }

    #[test]
    fn depends_on_union() {
        let parent = service("image: a\ndepends_on: [db]", "web");
        let child = service("image: a\ndepends_on: [cache, db]", "web");
        let merged = merge_service(&parent, &child);
        assert_eq!(merged.depends_on, vec!["db", "cache"]);
    }

    #[test]
    fn v1_lift_builds_logging() {
        let mut svc = service("image: a\nlog_driver: syslog\nlog_opt: {tag: web}", "web");
        lift_v1(&mut svc);
        let logging = svc.logging.unwrap();
        assert_eq!(logging.driver.as_deref(), Some("syslog"));
        assert_eq!(logging.options.0.get("tag").map(String::as_str), Some("web"));
        assert!(svc.log_driver.is_none());
    }

    #[test]
    fn extends_across_files() {
        let lookup = MapEnv::default();
        let resolver = MapResolver::default().with_file(
            "common.yml",
            "base:\n  image: busybox\n  environment:\n    TIER: shared\n",
        );
        let file = loader::load_file(
            b"web:\n  extends:\n    file: common.yml\n    service: base\n  environment:\n    TIER: web\n",
            "docker-compose.yml",
            &lookup,
        )
        .unwrap();

        let manifest = merge_files(&[file], &resolver, &lookup).unwrap();
        let web = manifest.service("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("busybox"));
        assert_eq!(web.environment.get("TIER"), Some(&Some("web".into())));
        assert!(web.extends.is_none());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let lookup = MapEnv::default();
        let resolver = MapResolver::default();
        let file = loader::load_file(
            b"a:\n  extends:\n    service: b\nb:\n  extends:\n    service: a\n",
            "compose.yml",
            &lookup,
        )
        .unwrap();

        let err = merge_files(&[file], &resolver, &lookup).unwrap_err();
        assert!(err.to_string().contains("cycle through extends"), "{err}");
    }

    #[test]
    fn overlay_scalar_precedence_and_list_concat() {
        let lookup = MapEnv::default();
        let resolver = MapResolver::default();
        let file1 = loader::load_file(
            b"web:\n  image: A\n  ports: [\"80\"]\n",
            "base.yml",
            &lookup,
        )
        .unwrap();
        let file2 = loader::load_file(
            b"web:\n  image: B\n  ports: [\"443\"]\n",
            "override.yml",
            &lookup,
        )
        .unwrap();

        let manifest = merge_files(&[file1, file2], &resolver, &lookup).unwrap();
        let web = manifest.service("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("B"));
        assert_eq!(web.ports, vec!["80", "443"]);
    }

    #[test]
    fn overlay_is_associative_for_scalars() {
        let lookup = MapEnv::default();
        let resolver = MapResolver::default();
        let load = |yaml: &[u8], id: &str| loader::load_file(yaml, id, &lookup).unwrap();

        let a = load(b"web:\n  image: A\n  user: alice\n", "a.yml");
        let b = load(b"web:\n  image: B\n", "b.yml");
        let c = load(b"web:\n  user: carol\n", "c.yml");

        let all_at_once =
            merge_files(&[a.clone(), b.clone(), c.clone()], &resolver, &lookup).unwrap();

        let bc = merge_service(
            b.services.get("web").unwrap(),
            c.services.get("web").unwrap(),
        );
        let folded = merge_service(a.services.get("web").unwrap(), &bc);

        let web = all_at_once.service("web").unwrap();
        assert_eq!(web.image, folded.image);
        assert_eq!(web.user, folded.user);
    }
}
