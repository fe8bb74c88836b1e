//! Manifest loading: bytes in, validated per-file service maps out.
//!
//! For each buffer the loader parses YAML, detects the manifest version,
//! interpolates environment variables, validates the raw tree against the
//! version's rules and converts service bodies into typed
//! [`ServiceConfig`] values. Merging happens afterwards in
//! [`super::merge`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::interpolation::{interpolate_value, EnvironmentLookup};
use super::merge::{self, DiskResolver};
use super::types::{Manifest, ManifestVersion, NetworkConfig, ServiceConfig, VolumeConfig};
use super::validation;
use crate::error::{Error, Result};

/// One loaded manifest file: interpolated, validated, typed, unmerged.
#[derive(Debug, Clone)]
pub struct RawFile {
    /// Stable identity of the source (path, or a synthetic buffer name).
    pub id: String,
    pub version: ManifestVersion,
    pub services: BTreeMap<String, ServiceConfig>,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub networks: BTreeMap<String, NetworkConfig>,
}

/// Parse, interpolate and validate a single manifest buffer.
pub fn load_file(bytes: &[u8], id: &str, lookup: &dyn EnvironmentLookup) -> Result<RawFile> {
    let mut doc: Value = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::InvalidManifest(format!("{id}: {e}")))?;

    let version = detect_version(&doc)?;

    interpolate_document(&mut doc, version, lookup)?;
    validation::validate_raw(&doc, version)?;

    let services_value = if version.has_services_section() {
        doc.get("services").cloned().unwrap_or(Value::Null)
    } else {
        doc.clone()
    };

    let mut services = BTreeMap::new();
    if let Value::Mapping(map) = services_value {
        for (name, body) in map {
            let name = name.as_str().expect("validated service name").to_string();
            if body.is_null() {
                return Err(Error::InvalidManifest(format!(
                    "services.{name}: service config must be a mapping"
                )));
            }
            let mut service: ServiceConfig =
                serde_yaml::from_value(body).map_err(|e| {
                    Error::InvalidManifest(format!("services.{name}: {e}"))
                })?;
            service.name = name.clone();
            services.insert(name, service);
        }
    }

    // v1 documents have no named sections; a root key `volumes` there is a
    // service, not a section.
    let (volumes, networks) = if version.has_services_section() {
        (
            named_section(doc.get("volumes"), "volumes")?,
            named_section(doc.get("networks"), "networks")?,
        )
    } else {
        (BTreeMap::new(), BTreeMap::new())
    };

    Ok(RawFile {
        id: id.to_string(),
        version,
        services,
        volumes,
        networks,
    })
}

fn detect_version(doc: &Value) -> Result<ManifestVersion> {
    let declared = doc
        .get("version")
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(Error::InvalidManifest(
                "version: must be a string".to_string(),
            )),
        })
        .transpose()?;

    match ManifestVersion::detect(declared.as_deref()) {
        Some(version) => Ok(version),
        None => Err(Error::UnsupportedVersion(declared.unwrap_or_default())),
    }
}

/// Interpolate service bodies with their service name in scope; other
/// sections interpolate without one. The `version` key is left alone.
fn interpolate_document(
    doc: &mut Value,
    version: ManifestVersion,
    lookup: &dyn EnvironmentLookup,
) -> Result<()> {
    if version.has_services_section() {
        if let Some(services) = doc.get_mut("services").and_then(Value::as_mapping_mut) {
            for (name, body) in services.iter_mut() {
                let service = name.as_str().map(str::to_string);
                let path = format!("services.{}", service.as_deref().unwrap_or("?"));
                interpolate_value(body, lookup, service.as_deref(), &path)?;
            }
        }
        for section in ["volumes", "networks"] {
            if let Some(value) = doc.get_mut(section) {
                interpolate_value(value, lookup, None, section)?;
            }
        }
    } else if let Some(root) = doc.as_mapping_mut() {
        for (name, body) in root.iter_mut() {
            let service = name.as_str().map(str::to_string);
            let path = format!("services.{}", service.as_deref().unwrap_or("?"));
            interpolate_value(body, lookup, service.as_deref(), &path)?;
        }
    }
    Ok(())
}

fn named_section<T>(value: Option<&Value>, section: &str) -> Result<BTreeMap<String, T>>
where
    T: serde::de::DeserializeOwned + Default,
{
    let mut out = BTreeMap::new();
    let Some(Value::Mapping(map)) = value else {
        return Ok(out);
    };
    for (name, body) in map {
        let name = name
            .as_str()
            .ok_or_else(|| Error::InvalidManifest(format!("{section}: names must be strings")))?
            .to_string();
        let parsed = if body.is_null() {
            T::default()
        } else {
            serde_yaml::from_value(body.clone())
                .map_err(|e| Error::InvalidManifest(format!("{section}.{name}: {e}")))?
        };
        out.insert(name, parsed);
    }
    Ok(out)
}

/// Loads and composes manifests into a [`Manifest`].
pub struct ManifestLoader;

/// Default manifest file names probed in a project directory.
const DEFAULT_NAMES: &[&str] = &["docker-compose.yml", "docker-compose.yaml"];
const OVERRIDE_NAMES: &[&str] = &["docker-compose.override.yml", "docker-compose.override.yaml"];

impl ManifestLoader {
    /// Default search order: `docker-compose.yml`, overlaid with
    /// `docker-compose.override.yml` when both exist. Explicit file lists
    /// replace this default entirely.
    pub fn find_default_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let base = DEFAULT_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
            .ok_or_else(|| {
                Error::InvalidManifest(format!(
                    "no docker-compose.yml found in {}",
                    dir.display()
                ))
            })?;

        let mut files = vec![base];
        if let Some(overlay) = OVERRIDE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
        {
            files.push(overlay);
        }
        Ok(files)
    }

    /// Load from explicit paths, merged left-to-right. The `.env` file next
    /// to the first manifest is layered under the process environment for
    /// interpolation, and `extends` files resolve relative to each
    /// manifest's directory.
    pub fn load_paths(paths: &[PathBuf], lookup: &dyn EnvironmentLookup) -> Result<Manifest> {
        let first = paths
            .first()
            .ok_or_else(|| Error::InvalidManifest("no manifest files supplied".to_string()))?;
        let base_dir = first
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(path)?;
            files.push(load_file(
                &bytes,
                &path.to_string_lossy(),
                lookup,
            )?);
        }

        let resolver = DiskResolver::new(base_dir);
        merge::merge_files(&files, &resolver, lookup)
    }

    /// Load from in-memory buffers, merged left-to-right.
    pub fn load_buffers(
        buffers: &[(&str, &[u8])],
        lookup: &dyn EnvironmentLookup,
        resolver: &dyn merge::FileResolver,
    ) -> Result<Manifest> {
        let mut files = Vec::with_capacity(buffers.len());
        for (id, bytes) in buffers {
            files.push(load_file(bytes, id, lookup)?);
        }
        merge::merge_files(&files, resolver, lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::interpolation::MapEnv;
    use crate::config::merge::MapResolver;

    #[test]
    fn v2_layout_with_sections() {
        let yaml = br#"
version: "2"
services:
  web:
    image: nginx
volumes:
  data:
networks:
  front:
    driver: bridge
"#;
        let file = load_file(yaml, "compose.yml", &MapEnv::default()).unwrap();
        assert_eq!(file.version, ManifestVersion::V2);
        assert!(file.services.contains_key("web"));
        assert!(file.volumes.contains_key("data"));
        assert_eq!(
            file.networks.get("front").unwrap().driver.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn v1_layout_services_at_root() {
        let file = load_file(b"web:\n  image: nginx\n", "compose.yml", &MapEnv::default())
            .unwrap();
        assert_eq!(file.version, ManifestVersion::V1);
        assert_eq!(
            file.services.get("web").unwrap().image.as_deref(),
            Some("nginx")
        );
    }

    #[test]
    fn numeric_version_key() {
        let file = load_file(
            b"version: 2\nservices:\n  web:\n    image: nginx\n",
            "compose.yml",
            &MapEnv::default(),
        )
        .unwrap();
        assert_eq!(file.version, ManifestVersion::V2);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = load_file(
            b"version: \"9\"\nservices: {}\n",
            "compose.yml",
            &MapEnv::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(v) if v == "9"));
    }

    #[test]
    fn unparseable_yaml_is_invalid_manifest() {
        let err = load_file(b"{invalid", "compose.yml", &MapEnv::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }

    #[test]
    fn interpolation_default_applied() {
        let yaml = b"web:\n  image: \"${IMG:-busybox}\"\n";

        let empty = load_file(yaml, "compose.yml", &MapEnv::default()).unwrap();
        assert_eq!(
            empty.services.get("web").unwrap().image.as_deref(),
            Some("busybox")
        );

        let set = load_file(yaml, "compose.yml", &MapEnv::new([("IMG", "nginx")])).unwrap();
        assert_eq!(
            set.services.get("web").unwrap().image.as_deref(),
            Some("nginx")
        );
    }

    #[test]
    fn manifests_without_interpolation_parse_identically() {
        let yaml = b"web:\n  image: nginx\n  command: echo hi\n";
        let a = load_file(yaml, "compose.yml", &MapEnv::default()).unwrap();
        let b = load_file(yaml, "compose.yml", &MapEnv::new([("UNUSED", "x")])).unwrap();
        assert_eq!(a.services, b.services);
    }

    #[test]
    fn load_buffers_merges_left_to_right() {
        let manifest = ManifestLoader::load_buffers(
            &[
                ("base.yml", b"web:\n  image: A\n" as &[u8]),
                ("override.yml", b"web:\n  image: B\n" as &[u8]),
            ],
            &MapEnv::default(),
            &MapResolver::default(),
        )
        .unwrap();
        assert_eq!(manifest.service("web").unwrap().image.as_deref(), Some("B"));
    }

    #[test]
    fn default_file_discovery() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), "web:\n  image: a\n").unwrap();

        let files = ManifestLoader::find_default_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);

        std::fs::write(
            dir.path().join("docker-compose.override.yml"),
            "web:\n  image: b\n",
        )
        .unwrap();
        let files = ManifestLoader::find_default_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[1].ends_with("docker-compose.override.yml"));
    }
}
