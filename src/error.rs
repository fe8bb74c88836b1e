use miette::Diagnostic;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("invalid manifest: {0}")]
    #[diagnostic(
        code(convoy::manifest::invalid),
        help("Check the manifest syntax; the message carries the offending path")
    )]
    InvalidManifest(String),

    #[error("unsupported manifest version '{0}'")]
    #[diagnostic(
        code(convoy::manifest::version),
        help("Supported versions: 1 (implicit), \"2\", \"2.0\", \"2.1\", \"3\"")
    )]
    UnsupportedVersion(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("service not found: {0}")]
    #[diagnostic(
        code(convoy::service::not_found),
        help("Check the service names declared under `services:` in the manifest")
    )]
    ServiceNotFound(String),

    #[error("circular dependency detected: {}", .0.join(" -> "))]
    #[diagnostic(
        code(convoy::dependency::circular),
        help("Services cannot depend on each other in a cycle. Review links, depends_on, volumes_from, network_mode and ipc")
    )]
    CircularDependency(Vec<String>),

    #[error("dependency '{dependency}' of service '{service}' failed")]
    DependencyFailed { service: String, dependency: String },

    #[error("image unavailable for service '{service}': {reason}")]
    #[diagnostic(
        code(convoy::image::unavailable),
        help("The image could neither be pulled nor built. Check the `image:` reference or the `build:` context")
    )]
    ImageUnavailable { service: String, reason: String },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("conflicting state: {0}")]
    #[diagnostic(code(convoy::state::conflict))]
    ConflictingState(String),

    #[error("operation cancelled for '{0}'")]
    Cancelled(String),

    /// Sentinel returned by an action to request a project reload. Handled by
    /// the project engine; callers never observe it.
    #[error("restart required")]
    RestartRequired,

    #[error("{} errors occurred:\n{}", .0.len(), .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Aggregate(Vec<Arc<Error>>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::InvalidManifest(msg) if msg.contains("interpolation") => Some(
                "Escape literal dollar signs as `$$`; variables must match ${NAME} or ${NAME:-default}".to_string(),
            ),
            Error::UnsupportedVersion(v) => Some(format!(
                "Version '{v}' is not recognised. Use `version: \"2\"` or omit the key for the legacy v1 layout."
            )),
            Error::CircularDependency(path) => Some(format!(
                "Break the cycle between: {}",
                path.join(", ")
            )),
            Error::ServiceNotFound(name) => Some(format!(
                "'{name}' is referenced but never declared. Add it under `services:` or mark the reference as external."
            )),
            Error::ImageUnavailable { service, .. } => Some(format!(
                "Give '{service}' a pullable `image:` or a `build:` context that exists on disk."
            )),
            Error::ConflictingState(_) => Some(
                "Remove the custom `container_name` to scale the service beyond one replica".to_string(),
            ),
            Error::Engine(e) if e.transient() => Some(
                "The engine connection hiccupped; the operation is safe to retry".to_string(),
            ),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-facing display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{self}\n\nHint: {suggestion}"),
            None => self.to_string(),
        }
    }

    /// True for the reload sentinel, which the project engine consumes
    /// internally.
    pub fn is_restart(&self) -> bool {
        matches!(self, Error::RestartRequired)
    }

    /// Collapse a list of errors into a single one: the sole element is
    /// returned as-is, more than one becomes [`Error::Aggregate`].
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Aggregate(errors.into_iter().map(Arc::new).collect())),
        }
    }

    /// Like [`Error::aggregate`] over shared errors. A sole error is
    /// unwrapped when this is its last reference; otherwise it is carried
    /// as a one-element aggregate.
    pub fn aggregate_shared(mut errors: Vec<Arc<Error>>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(match Arc::try_unwrap(errors.remove(0)) {
                Ok(err) => err,
                Err(arc) => Error::Aggregate(vec![arc]),
            }),
            _ => Some(Error::Aggregate(errors)),
        }
    }
}
