//! Manifest loading, interpolation, validation and merging.
//!
//! The pipeline: [`loader`] parses and interpolates each file and applies
//! the version-bound validation, [`merge`] resolves `extends` inheritance
//! and folds multi-file overlays, and the result is an immutable
//! [`Manifest`] of typed [`ServiceConfig`] values.

pub mod env_loader;
pub mod interpolation;
pub mod loader;
pub mod merge;
pub mod shapes;
pub mod types;
pub mod validation;

pub use interpolation::{ChainedEnv, EnvironmentLookup, MapEnv, ProcessEnv};
pub use loader::{ManifestLoader, RawFile};
pub use merge::{DiskResolver, FileResolver, MapResolver};
pub use shapes::{
    CommandLine, Environment, KeyValueMap, RestartPolicy, StringOrList, Ulimit, Ulimits,
};
pub use types::{
    BuildConfig, ExtendsConfig, LoggingConfig, Manifest, ManifestVersion, MemBytes,
    NamespaceMode, NetworkBinding, NetworkConfig, ServiceConfig, ServiceNetworks, VolumeConfig,
};
pub use validation::PortSpec;
