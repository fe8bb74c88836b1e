//! Container engine capability set.
//!
//! [`EngineClient`] is the narrow seam between the project engine and
//! whatever container engine actually runs the workload. Every operation
//! takes a [`CancellationToken`]; cancelling a project action propagates
//! here and the adapter is expected to abandon the call. Transport details
//! (HTTP, TLS, build-context tarring) live entirely in adapters.
//!
//! [`memory::InMemoryEngine`] is a complete in-process implementation used
//! by the test suites and for dry-running projects without an engine.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use memory::InMemoryEngine;
pub use types::*;

/// Error kinds surfaced by an engine adapter.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    #[error("no such image: {0}")]
    ImageNotFound(String),

    #[error("no such network: {0}")]
    NetworkNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure (connection reset, refused, timed out).
    /// The only category the runtime retries.
    #[error("engine transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether the failure is transient and worth one retry.
    pub fn transient(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The capability set the orchestrator needs from a container engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    // Containers

    async fn inspect_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> EngineResult<ContainerDetails>;

    /// List containers matching every label in the filter. `all` includes
    /// stopped containers.
    async fn list_containers(
        &self,
        cancel: &CancellationToken,
        filter: &LabelFilter,
        all: bool,
    ) -> EngineResult<Vec<ContainerSummary>>;

    /// Create a container; returns the engine-assigned id. A name collision
    /// fails with [`EngineError::Conflict`].
    async fn create_container(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: CreateSpec,
    ) -> EngineResult<String>;

    async fn start_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()>;

    /// SIGTERM, then SIGKILL after `timeout`.
    async fn stop_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> EngineResult<()>;

    async fn restart_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> EngineResult<()>;

    async fn kill_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        signal: &str,
    ) -> EngineResult<()>;

    async fn pause_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()>;

    async fn unpause_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()>;

    async fn rename_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        new_name: &str,
    ) -> EngineResult<()>;

    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> EngineResult<()>;

    async fn container_logs(
        &self,
        cancel: &CancellationToken,
        id: &str,
        options: LogsOptions,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>>;

    /// Attach to a running container's output.
    async fn attach_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<i64>;

    // Images

    async fn inspect_image(
        &self,
        cancel: &CancellationToken,
        reference: &str,
    ) -> EngineResult<ImageDetails>;

    async fn pull_image(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        auth: Option<RegistryAuth>,
    ) -> EngineResult<()>;

    /// Build an image and tag it. Context preparation is the adapter's
    /// concern.
    async fn build_image(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        request: &BuildRequest,
    ) -> EngineResult<()>;

    async fn list_images(&self, cancel: &CancellationToken) -> EngineResult<Vec<ImageDetails>>;

    // Networks

    async fn create_network(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: NetworkSpec,
    ) -> EngineResult<()>;

    async fn connect_network(
        &self,
        cancel: &CancellationToken,
        network: &str,
        container: &str,
        attachment: NetworkAttachment,
    ) -> EngineResult<()>;

    async fn disconnect_network(
        &self,
        cancel: &CancellationToken,
        network: &str,
        container: &str,
        force: bool,
    ) -> EngineResult<()>;

    // Events

    async fn events(
        &self,
        cancel: &CancellationToken,
        filter: &LabelFilter,
    ) -> EngineResult<BoxStream<'static, EngineResult<EngineEvent>>>;
}

/// Retry a closure once when the engine reports a transient failure.
pub async fn with_transient_retry<T, F, Fut>(op: F) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    match op().await {
        Err(e) if e.transient() => {
            tracing::debug!(error = %e, "transient engine error, retrying once");
            op().await
        }
        other => other,
    }
}
