//! Engine-backed view of one owned container.
//!
//! A [`ContainerHandle`] pairs an inspect snapshot with the engine client
//! it came from. The snapshot is never cached across lifecycle passes;
//! the runtime re-enumerates containers from the engine on every action.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::labels;
use super::naming::parse_number_label;
use crate::engine::{
    ContainerDetails, EngineClient, EngineResult, LogChunk, LogsOptions,
};

#[derive(Clone)]
pub struct ContainerHandle {
    engine: Arc<dyn EngineClient>,
    details: ContainerDetails,
}

impl ContainerHandle {
    pub fn new(engine: Arc<dyn EngineClient>, details: ContainerDetails) -> Self {
        ContainerHandle { engine, details }
    }

    pub fn id(&self) -> &str {
        &self.details.id
    }

    /// The 12-character short id used in renamed-container suffixes.
    pub fn short_id(&self) -> &str {
        let id = &self.details.id;
        &id[..id.len().min(12)]
    }

    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn details(&self) -> &ContainerDetails {
        &self.details
    }

    pub fn is_running(&self) -> bool {
        self.details.state.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.details.state == crate::engine::ContainerState::Paused
    }

    /// The `config-hash` label written at create time.
    pub fn config_hash(&self) -> Option<&str> {
        self.details.label(labels::CONFIG_HASH)
    }

    /// The replica ordinal from the `number` label.
    pub fn number(&self) -> Option<u32> {
        parse_number_label(self.details.label(labels::NUMBER))
    }

    pub fn is_one_off(&self) -> bool {
        self.details.label(labels::ONEOFF) == Some("True")
    }

    /// Re-inspect and return a fresh handle.
    pub async fn refreshed(&self, cancel: &CancellationToken) -> EngineResult<ContainerHandle> {
        let details = self.engine.inspect_container(cancel, &self.details.id).await?;
        Ok(ContainerHandle {
            engine: Arc::clone(&self.engine),
            details,
        })
    }

    pub async fn start(&self, cancel: &CancellationToken) -> EngineResult<()> {
        self.engine.start_container(cancel, &self.details.id).await
    }

    pub async fn stop(&self, cancel: &CancellationToken, timeout: Duration) -> EngineResult<()> {
        self.engine
            .stop_container(cancel, &self.details.id, timeout)
            .await
    }

    pub async fn restart(&self, cancel: &CancellationToken, timeout: Duration) -> EngineResult<()> {
        self.engine
            .restart_container(cancel, &self.details.id, timeout)
            .await
    }

    pub async fn kill(&self, cancel: &CancellationToken, signal: &str) -> EngineResult<()> {
        self.engine
            .kill_container(cancel, &self.details.id, signal)
            .await
    }

    pub async fn pause(&self, cancel: &CancellationToken) -> EngineResult<()> {
        self.engine.pause_container(cancel, &self.details.id).await
    }

    pub async fn unpause(&self, cancel: &CancellationToken) -> EngineResult<()> {
        self.engine.unpause_container(cancel, &self.details.id).await
    }

    pub async fn rename(&self, cancel: &CancellationToken, new_name: &str) -> EngineResult<()> {
        self.engine
            .rename_container(cancel, &self.details.id, new_name)
            .await
    }

    pub async fn remove(
        &self,
        cancel: &CancellationToken,
        force: bool,
        remove_volumes: bool,
    ) -> EngineResult<()> {
        self.engine
            .remove_container(cancel, &self.details.id, force, remove_volumes)
            .await
    }

    pub async fn logs(
        &self,
        cancel: &CancellationToken,
        options: LogsOptions,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>> {
        self.engine
            .container_logs(cancel, &self.details.id, options)
            .await
    }

    pub async fn attach(
        &self,
        cancel: &CancellationToken,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>> {
        self.engine.attach_container(cancel, &self.details.id).await
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> EngineResult<i64> {
        self.engine.wait_container(cancel, &self.details.id).await
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.details.id)
            .field("name", &self.details.name)
            .field("state", &self.details.state)
            .finish()
    }
}
