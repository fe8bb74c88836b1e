//! Typed manifest model.
//!
//! [`Manifest`] is the merged, validated view of a project: one
//! [`ServiceConfig`] per service plus the named volume and network maps.
//! It is produced once by the loader/merger and never mutated afterwards.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use super::shapes::{
    CommandLine, Environment, KeyValueMap, RestartPolicy, StringOrList, Ulimits,
};

/// Manifest format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestVersion {
    /// Legacy layout: service names at the document root.
    V1,
    V2,
    V2_1,
    V3,
}

impl ManifestVersion {
    /// Maps a `version:` string to a known version. `None` input means the
    /// key was absent, which implies v1.
    pub fn detect(version: Option<&str>) -> Option<ManifestVersion> {
        match version {
            None => Some(ManifestVersion::V1),
            Some("2") | Some("2.0") => Some(ManifestVersion::V2),
            Some("2.1") => Some(ManifestVersion::V2_1),
            Some("3") | Some("3.0") => Some(ManifestVersion::V3),
            Some(_) => None,
        }
    }

    pub fn has_services_section(&self) -> bool {
        !matches!(self, ManifestVersion::V1)
    }
}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestVersion::V1 => write!(f, "1"),
            ManifestVersion::V2 => write!(f, "2"),
            ManifestVersion::V2_1 => write!(f, "2.1"),
            ManifestVersion::V3 => write!(f, "3"),
        }
    }
}

/// Build section: a bare string is shorthand for `{context: <path>}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BuildConfig {
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "KeyValueMap::is_empty")]
    pub args: KeyValueMap,
}

impl<'de> Deserialize<'de> for BuildConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Context(String),
            Full {
                context: String,
                #[serde(default)]
                dockerfile: Option<String>,
                #[serde(default)]
                args: KeyValueMap,
            },
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Context(context) => BuildConfig {
                context,
                dockerfile: None,
                args: KeyValueMap::default(),
            },
            Repr::Full {
                context,
                dockerfile,
                args,
            } => BuildConfig {
                context,
                dockerfile,
                args,
            },
        })
    }
}

/// `extends:` reference to a parent service, optionally in another file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub service: String,
}

/// Logging driver selection and its options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "KeyValueMap::is_empty")]
    pub options: KeyValueMap,
}

/// `network_mode` / `ipc` style namespace reference.
///
/// Wraps the raw string and exposes the `service:<name>` and
/// `container:<id>` reference forms, which create dependency edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceMode(pub String);

impl NamespaceMode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The referenced service name for the `service:<name>` form.
    pub fn service_ref(&self) -> Option<&str> {
        self.0.strip_prefix("service:").filter(|s| !s.is_empty())
    }

    /// The referenced container for the `container:<id>` form.
    pub fn container_ref(&self) -> Option<&str> {
        self.0.strip_prefix("container:").filter(|s| !s.is_empty())
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One network attachment of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkBinding {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

/// The `networks:` key of a service: a plain list of names or a mapping of
/// name to binding options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ServiceNetworks(pub Vec<NetworkBinding>);

impl ServiceNetworks {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|b| b.name == name)
    }
}

impl<'de> Deserialize<'de> for ServiceNetworks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Names(Vec<String>),
            Bindings(BTreeMap<String, Option<NetworkBinding>>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Names(names) => ServiceNetworks(
                names
                    .into_iter()
                    .map(|name| NetworkBinding {
                        name,
                        ..NetworkBinding::default()
                    })
                    .collect(),
            ),
            Repr::Bindings(map) => ServiceNetworks(
                map.into_iter()
                    .map(|(name, binding)| {
                        let mut binding = binding.unwrap_or_default();
                        binding.name = name;
                        binding
                    })
                    .collect(),
            ),
        })
    }
}

/// A byte count written as an integer or as a string with a binary suffix
/// (`512m`, `2g`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemBytes(pub i64);

impl MemBytes {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (digits, multiplier) = match s.chars().last() {
            Some('b' | 'B') => (&s[..s.len() - 1], 1),
            Some('k' | 'K') => (&s[..s.len() - 1], 1024),
            Some('m' | 'M') => (&s[..s.len() - 1], 1024 * 1024),
            Some('g' | 'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            _ => (s, 1),
        };
        digits
            .trim()
            .parse::<i64>()
            .map(|n| MemBytes(n * multiplier))
            .map_err(|_| format!("invalid byte count: {s:?}"))
    }
}

impl<'de> Deserialize<'de> for MemBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(i64),
            Human(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(MemBytes(n)),
            Repr::Human(s) => MemBytes::parse(&s).map_err(de::Error::custom),
        }
    }
}

impl Serialize for MemBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

/// The typed description of one service.
///
/// Field spellings follow the manifest format; v1-only keys (`net`,
/// `log_driver`, `log_opt`, top-level `dockerfile`) are accepted here and
/// folded into their v2 shapes by the merger's lift pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Set from the map key during loading; not part of the YAML body.
    #[serde(skip)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// v1 sibling of a string-form `build:`; lifted into `build.dockerfile`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domainname: Option<String>,

    #[serde(skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub env_file: StringOrList,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<String>,
    #[serde(alias = "net", skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<NamespaceMode>,
    #[serde(skip_serializing_if = "ServiceNetworks::is_empty")]
    pub networks: ServiceNetworks,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_links: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub dns: StringOrList,
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub dns_search: StringOrList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_driver: Option<String>,
    #[serde(skip_serializing_if = "StringOrList::is_empty")]
    pub tmpfs: StringOrList,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<NamespaceMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_parent: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<MemBytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memswap_limit: Option<MemBytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ulimits: Ulimits,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stdin_open: bool,
    #[serde(skip_serializing_if = "KeyValueMap::is_empty")]
    pub labels: KeyValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    /// v1 spellings, lifted into `logging` by the merger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_driver: Option<String>,
    #[serde(skip_serializing_if = "KeyValueMap::is_empty")]
    pub log_opt: KeyValueMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<ExtendsConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ServiceConfig {
    /// The image this service materialises as: the explicit `image:` or the
    /// project-scoped build tag.
    pub fn image_name(&self, project: &str) -> String {
        match &self.image {
            Some(image) if !image.is_empty() => image.clone(),
            _ => format!("{project}_{}", self.name),
        }
    }

    pub fn has_build(&self) -> bool {
        self.build.is_some()
    }
}

/// Named volume declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "KeyValueMap::is_empty")]
    pub driver_opts: KeyValueMap,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

/// Named network declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "KeyValueMap::is_empty")]
    pub driver_opts: KeyValueMap,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

/// The merged project manifest: the output of loading, interpolating,
/// validating and merging every supplied file.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub version: Option<ManifestVersion>,
    pub services: BTreeMap<String, ServiceConfig>,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub networks: BTreeMap<String, NetworkConfig>,
}

impl Manifest {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}
