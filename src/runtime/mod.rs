//! Per-service runtime: manifest config in, engine operations out.
//!
//! A [`ServiceRuntime`] owns the lifecycle of the containers belonging to
//! one service. It discovers them by label filter on every pass, decides
//! between reuse and recreate from the config fingerprint, and executes
//! one verb at a time against them. Cross-service context arrives through
//! a [`ProjectView`] capability instead of a back-reference to the
//! project.

pub mod container;
pub mod convert;
pub mod labels;
pub mod naming;
pub mod service;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::interpolation::EnvironmentLookup;
use crate::engine::EngineClient;
use crate::events::EventBus;

pub use container::ContainerHandle;
pub use naming::ContainerNamer;
pub use service::{ContainerLogs, ContainerSelection, ServiceRuntime};

/// The slice of project context a service runtime needs: identity, engine
/// access, the event bus and the interpolation lookup. Cheap to clone.
#[derive(Clone)]
pub struct ProjectView {
    pub project: String,
    pub base_dir: PathBuf,
    pub engine: Arc<dyn EngineClient>,
    pub bus: EventBus,
    pub lookup: Arc<dyn EnvironmentLookup>,
}
