//! In-process engine implementation.
//!
//! A complete, deterministic stand-in for a real container engine:
//! containers, images and networks live in one mutex-guarded state table,
//! every mutation is appended to an operation log for assertions, and
//! failures can be injected per operation. The integration suites drive
//! the whole project engine against this implementation; it is also handy
//! for dry-running a manifest without touching a real engine.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::types::*;
use super::{EngineClient, EngineError, EngineResult};
use async_trait::async_trait;

#[derive(Debug, Clone)]
struct ContainerRecord {
    id: String,
    name: String,
    spec: CreateSpec,
    state: ContainerState,
    exit_code: Option<i64>,
    image_id: String,
    networks: Vec<String>,
    created_at: chrono::DateTime<Utc>,
    logs: Vec<LogChunk>,
}

struct Injection {
    op: &'static str,
    needle: String,
    error: EngineError,
    once: bool,
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, ContainerRecord>,
    /// image reference -> engine-side id
    images: BTreeMap<String, String>,
    networks: BTreeMap<String, NetworkSpec>,
    operations: Vec<(String, String)>,
    injections: Vec<Injection>,
    /// container-name substring -> exit code applied when started
    auto_exit: Vec<(String, i64)>,
    next_id: u64,
    events: Vec<EngineEvent>,
}

impl Inner {
    fn find_by_ref(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> EngineResult<&mut ContainerRecord> {
        let id = self
            .find_by_ref(id_or_name)
            .ok_or_else(|| EngineError::ContainerNotFound(id_or_name.to_string()))?;
        Ok(self.containers.get_mut(&id).expect("resolved id"))
    }

    fn record(&mut self, op: &str, target: &str) {
        self.operations.push((op.to_string(), target.to_string()));
    }

    fn check_injection(&mut self, op: &'static str, target: &str) -> EngineResult<()> {
        let hit = self
            .injections
            .iter()
            .position(|i| i.op == op && target.contains(&i.needle));
        if let Some(idx) = hit {
            let error = self.injections[idx].error.clone();
            if self.injections[idx].once {
                self.injections.remove(idx);
            }
            return Err(error);
        }
        Ok(())
    }

    fn emit(&mut self, action: &str, container: &ContainerRecord) {
        let mut attributes = container.spec.labels.clone();
        attributes.insert("name".to_string(), container.name.clone());
        attributes.insert("image".to_string(), container.spec.image.clone());
        self.events.push(EngineEvent {
            action: action.to_string(),
            container_id: container.id.clone(),
            attributes,
            timestamp: Utc::now(),
        });
    }
}

/// The shared in-memory engine. Cheap to clone; all clones view the same
/// state.
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image as already present, with a derived id.
    pub fn seed_image(&self, reference: &str) {
        let mut inner = self.inner.lock();
        if !inner.images.contains_key(reference) {
            let id = format!("sha256:{:048}", inner.next_id);
            inner.next_id += 1;
            inner.images.insert(reference.to_string(), id);
        }
    }

    /// Override an image's engine-side id, simulating an upstream retag.
    pub fn set_image_id(&self, reference: &str, id: &str) {
        self.inner
            .lock()
            .images
            .insert(reference.to_string(), id.to_string());
    }

    /// Containers whose name contains `needle` exit with `code` as soon as
    /// they are started. Used to model one-off and short-lived commands.
    pub fn auto_exit(&self, needle: &str, code: i64) {
        self.inner.lock().auto_exit.push((needle.to_string(), code));
    }

    /// Make the next matching call fail with `error`.
    pub fn fail_once(&self, op: &'static str, needle: &str, error: EngineError) {
        self.inner.lock().injections.push(Injection {
            op,
            needle: needle.to_string(),
            error,
            once: true,
        });
    }

    /// Make every matching call fail with `error`.
    pub fn fail_always(&self, op: &'static str, needle: &str, error: EngineError) {
        self.inner.lock().injections.push(Injection {
            op,
            needle: needle.to_string(),
            error,
            once: false,
        });
    }

    /// Append a log line to a container's buffer.
    pub fn push_log(&self, id_or_name: &str, stream: LogStream, line: &str) {
        let mut inner = self.inner.lock();
        if let Ok(container) = inner.container_mut(id_or_name) {
            container.logs.push(LogChunk {
                stream,
                line: line.to_string(),
            });
        }
    }

    /// The ordered `(operation, target-name)` mutation log.
    pub fn operations(&self) -> Vec<(String, String)> {
        self.inner.lock().operations.clone()
    }

    /// Operation names recorded against targets containing `needle`.
    pub fn operations_for(&self, needle: &str) -> Vec<String> {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|(_, target)| target.contains(needle))
            .map(|(op, _)| op.clone())
            .collect()
    }

    /// Current container names, sorted.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    fn ensure_live(cancel: &CancellationToken) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn summarize(record: &ContainerRecord) -> ContainerSummary {
        ContainerSummary {
            id: record.id.clone(),
            name: record.name.clone(),
            image: record.spec.image.clone(),
            state: record.state,
            labels: record.spec.labels.clone(),
        }
    }

    fn details(record: &ContainerRecord) -> ContainerDetails {
        ContainerDetails {
            id: record.id.clone(),
            name: record.name.clone(),
            state: record.state,
            exit_code: record.exit_code,
            image: record.spec.image.clone(),
            image_id: record.image_id.clone(),
            labels: record.spec.labels.clone(),
            binds: record.spec.host.binds.clone(),
            port_bindings: record.spec.host.port_bindings.clone(),
            networks: record.networks.clone(),
            created_at: record.created_at,
        }
    }

    fn start_record(inner: &mut Inner, id: &str) -> EngineResult<()> {
        let auto_exit = inner.auto_exit.clone();
        let container = inner.container_mut(id)?;
        match container.state {
            ContainerState::Paused => {
                return Err(EngineError::Conflict(format!(
                    "container {} is paused, unpause instead",
                    container.name
                )))
            }
            ContainerState::Running => return Ok(()),
            ContainerState::Created | ContainerState::Exited => {}
        }

        let exit = auto_exit
            .iter()
            .find(|(needle, _)| container.name.contains(needle))
            .map(|(_, code)| *code)
            .or_else(|| parse_exit_command(&container.spec));

        match exit {
            Some(code) => {
                container.state = ContainerState::Exited;
                container.exit_code = Some(code);
            }
            None => {
                container.state = ContainerState::Running;
                container.exit_code = None;
            }
        }
        let snapshot = container.clone();
        inner.emit("start", &snapshot);
        Ok(())
    }
}

/// Recognise `... "exit N"` commands so short-lived one-offs terminate on
/// their own.
fn parse_exit_command(spec: &CreateSpec) -> Option<i64> {
    let last = spec.command.as_ref()?.last()?;
    let trimmed = last.trim();
    let code = trimmed.strip_prefix("exit ")?.trim();
    code.parse().ok()
}

#[async_trait]
impl EngineClient for InMemoryEngine {
    async fn inspect_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> EngineResult<ContainerDetails> {
        Self::ensure_live(cancel)?;
        let inner = self.inner.lock();
        let resolved = inner
            .find_by_ref(id)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?;
        Ok(Self::details(&inner.containers[&resolved]))
    }

    async fn list_containers(
        &self,
        cancel: &CancellationToken,
        filter: &LabelFilter,
        all: bool,
    ) -> EngineResult<Vec<ContainerSummary>> {
        Self::ensure_live(cancel)?;
        let inner = self.inner.lock();
        Ok(inner
            .containers
            .values()
            .filter(|c| all || c.state.is_running())
            .filter(|c| filter.matches(&c.spec.labels))
            .map(Self::summarize)
            .collect())
    }

    async fn create_container(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: CreateSpec,
    ) -> EngineResult<String> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        inner.check_injection("create", name)?;

        if inner.find_by_ref(name).is_some() {
            return Err(EngineError::Conflict(format!(
                "container name {name:?} is already in use"
            )));
        }
        let image_id = inner
            .images
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| EngineError::ImageNotFound(spec.image.clone()))?;

        // Short-id (first 12 chars) must already be unique, so the counter
        // leads the id.
        let id = format!("{:012x}{:052x}", inner.next_id, inner.next_id);
        inner.next_id += 1;

        let record = ContainerRecord {
            id: id.clone(),
            name: name.to_string(),
            spec,
            state: ContainerState::Created,
            exit_code: None,
            image_id,
            networks: Vec::new(),
            created_at: Utc::now(),
            logs: Vec::new(),
        };
        inner.record("create", name);
        inner.emit("create", &record);
        inner.containers.insert(id.clone(), record);
        Ok(id)
    }

    async fn start_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let name = inner.container_mut(id)?.name.clone();
        inner.check_injection("start", &name)?;
        Self::start_record(&mut inner, id)?;
        inner.record("start", &name);
        Ok(())
    }

    async fn stop_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        _timeout: Duration,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let name = inner.container_mut(id)?.name.clone();
        inner.check_injection("stop", &name)?;
        let container = inner.container_mut(id)?;
        if container.state.is_running() {
            container.state = ContainerState::Exited;
            container.exit_code = Some(0);
            let snapshot = container.clone();
            inner.emit("stop", &snapshot);
        }
        inner.record("stop", &name);
        Ok(())
    }

    async fn restart_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> EngineResult<()> {
        self.stop_container(cancel, id, timeout).await?;
        self.start_container(cancel, id).await?;
        let mut inner = self.inner.lock();
        let name = inner.container_mut(id)?.name.clone();
        inner.record("restart", &name);
        Ok(())
    }

    async fn kill_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        signal: &str,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let name = inner.container_mut(id)?.name.clone();
        inner.check_injection("kill", &name)?;
        let container = inner.container_mut(id)?;
        if !container.state.is_running() {
            return Err(EngineError::Conflict(format!(
                "cannot kill {}: not running",
                container.name
            )));
        }
        container.state = ContainerState::Exited;
        container.exit_code = Some(137);
        let snapshot = container.clone();
        inner.emit("kill", &snapshot);
        inner.record("kill", &format!("{name}:{signal}"));
        Ok(())
    }

    async fn pause_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        match container.state {
            ContainerState::Running => {
                container.state = ContainerState::Paused;
                let name = container.name.clone();
                inner.record("pause", &name);
                Ok(())
            }
            _ => Err(EngineError::Conflict(format!(
                "cannot pause {}: not running",
                container.name
            ))),
        }
    }

    async fn unpause_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        match container.state {
            ContainerState::Paused => {
                container.state = ContainerState::Running;
                let name = container.name.clone();
                inner.record("unpause", &name);
                Ok(())
            }
            _ => Err(EngineError::Conflict(format!(
                "cannot unpause {}: not paused",
                container.name
            ))),
        }
    }

    async fn rename_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        new_name: &str,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        if inner.find_by_ref(new_name).is_some() {
            return Err(EngineError::Conflict(format!(
                "container name {new_name:?} is already in use"
            )));
        }
        let container = inner.container_mut(id)?;
        let old = container.name.clone();
        container.name = new_name.to_string();
        inner.record("rename", &format!("{old}->{new_name}"));
        Ok(())
    }

    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
        force: bool,
        _remove_volumes: bool,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let resolved = inner
            .find_by_ref(id)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?;
        let container = &inner.containers[&resolved];
        let name = container.name.clone();
        inner.check_injection("remove", &name)?;
        if inner.containers[&resolved].state.is_running() && !force {
            return Err(EngineError::Conflict(format!(
                "cannot remove running container {name}"
            )));
        }
        let record = inner.containers.remove(&resolved).expect("resolved id");
        inner.emit("destroy", &record);
        inner.record("remove", &name);
        Ok(())
    }

    async fn container_logs(
        &self,
        cancel: &CancellationToken,
        id: &str,
        options: LogsOptions,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let container = inner.container_mut(id)?;
        let mut chunks = container.logs.clone();
        if let Some(tail) = options.tail {
            if chunks.len() > tail {
                chunks = chunks.split_off(chunks.len() - tail);
            }
        }
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn attach_container(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogChunk>>> {
        self.container_logs(cancel, id, LogsOptions::default()).await
    }

    async fn wait_container(&self, cancel: &CancellationToken, id: &str) -> EngineResult<i64> {
        let id = {
            let inner = self.inner.lock();
            inner
                .find_by_ref(id)
                .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?
        };
        loop {
            Self::ensure_live(cancel)?;
            {
                let inner = self.inner.lock();
                let container = inner
                    .containers
                    .get(&id)
                    .ok_or_else(|| EngineError::ContainerNotFound(id.clone()))?;
                if container.state == ContainerState::Exited {
                    return Ok(container.exit_code.unwrap_or(0));
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn inspect_image(
        &self,
        cancel: &CancellationToken,
        reference: &str,
    ) -> EngineResult<ImageDetails> {
        Self::ensure_live(cancel)?;
        let inner = self.inner.lock();
        inner
            .images
            .get(reference)
            .map(|id| ImageDetails {
                id: id.clone(),
                tags: vec![reference.to_string()],
            })
            .ok_or_else(|| EngineError::ImageNotFound(reference.to_string()))
    }

    async fn pull_image(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        _auth: Option<RegistryAuth>,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        inner.check_injection("pull", reference)?;
        inner.record("pull", reference);
        if !inner.images.contains_key(reference) {
            let id = format!("sha256:{:048}", inner.next_id);
            inner.next_id += 1;
            inner.images.insert(reference.to_string(), id);
        }
        Ok(())
    }

    async fn build_image(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        _request: &BuildRequest,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        inner.check_injection("build", tag)?;
        inner.record("build", tag);
        let id = format!("sha256:{:048}", inner.next_id);
        inner.next_id += 1;
        inner.images.insert(tag.to_string(), id);
        Ok(())
    }

    async fn list_images(&self, cancel: &CancellationToken) -> EngineResult<Vec<ImageDetails>> {
        Self::ensure_live(cancel)?;
        let inner = self.inner.lock();
        Ok(inner
            .images
            .iter()
            .map(|(tag, id)| ImageDetails {
                id: id.clone(),
                tags: vec![tag.clone()],
            })
            .collect())
    }

    async fn create_network(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: NetworkSpec,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        inner.record("network_create", name);
        inner.networks.entry(name.to_string()).or_insert(spec);
        Ok(())
    }

    async fn connect_network(
        &self,
        cancel: &CancellationToken,
        network: &str,
        container: &str,
        _attachment: NetworkAttachment,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        if !inner.networks.contains_key(network) {
            return Err(EngineError::NetworkNotFound(network.to_string()));
        }
        let network = network.to_string();
        let record = inner.container_mut(container)?;
        if !record.networks.contains(&network) {
            record.networks.push(network.clone());
        }
        let name = record.name.clone();
        inner.record("network_connect", &format!("{network}:{name}"));
        Ok(())
    }

    async fn disconnect_network(
        &self,
        cancel: &CancellationToken,
        network: &str,
        container: &str,
        _force: bool,
    ) -> EngineResult<()> {
        Self::ensure_live(cancel)?;
        let mut inner = self.inner.lock();
        let network = network.to_string();
        let record = inner.container_mut(container)?;
        record.networks.retain(|n| n != &network);
        let name = record.name.clone();
        inner.record("network_disconnect", &format!("{network}:{name}"));
        Ok(())
    }

    async fn events(
        &self,
        cancel: &CancellationToken,
        filter: &LabelFilter,
    ) -> EngineResult<BoxStream<'static, EngineResult<EngineEvent>>> {
        Self::ensure_live(cancel)?;
        let inner = self.inner.lock();
        let filter = filter.clone();
        let events: Vec<EngineEvent> = inner
            .events
            .iter()
            .filter(|e| filter.matches(&e.attributes))
            .cloned()
            .collect();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn spec(image: &str) -> CreateSpec {
        CreateSpec {
            image: image.to_string(),
            ..CreateSpec::default()
        }
    }

    #[tokio::test]
    async fn create_requires_image() {
        let engine = InMemoryEngine::new();
        let err = engine
            .create_container(&cancel(), "web_1", spec("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn name_conflict_on_create() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        engine
            .create_container(&cancel(), "web_1", spec("busybox"))
            .await
            .unwrap();
        let err = engine
            .create_container(&cancel(), "web_1", spec("busybox"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        let id = engine
            .create_container(&cancel(), "web_1", spec("busybox"))
            .await
            .unwrap();

        engine.start_container(&cancel(), &id).await.unwrap();
        let details = engine.inspect_container(&cancel(), &id).await.unwrap();
        assert_eq!(details.state, ContainerState::Running);

        engine.pause_container(&cancel(), &id).await.unwrap();
        engine.unpause_container(&cancel(), &id).await.unwrap();

        engine
            .stop_container(&cancel(), &id, Duration::from_secs(10))
            .await
            .unwrap();
        let details = engine.inspect_container(&cancel(), &id).await.unwrap();
        assert_eq!(details.state, ContainerState::Exited);
        assert_eq!(details.exit_code, Some(0));
    }

    #[tokio::test]
    async fn remove_running_requires_force() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        let id = engine
            .create_container(&cancel(), "web_1", spec("busybox"))
            .await
            .unwrap();
        engine.start_container(&cancel(), &id).await.unwrap();

        let err = engine
            .remove_container(&cancel(), &id, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        engine
            .remove_container(&cancel(), &id, true, false)
            .await
            .unwrap();
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn exit_command_is_simulated() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        let mut s = spec("busybox");
        s.command = Some(vec!["/bin/sh".into(), "-c".into(), "exit 7".into()]);
        let id = engine
            .create_container(&cancel(), "web_run_1", s)
            .await
            .unwrap();
        engine.start_container(&cancel(), &id).await.unwrap();
        let code = engine.wait_container(&cancel(), &id).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn label_filtering_in_list() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        let mut labelled = spec("busybox");
        labelled
            .labels
            .insert("tier".to_string(), "web".to_string());
        engine
            .create_container(&cancel(), "web_1", labelled)
            .await
            .unwrap();
        engine
            .create_container(&cancel(), "db_1", spec("busybox"))
            .await
            .unwrap();

        let filter = LabelFilter::new().label("tier", "web");
        let listed = engine
            .list_containers(&cancel(), &filter, true)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "web_1");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let engine = InMemoryEngine::new();
        engine.seed_image("busybox");
        engine.fail_once("start", "web", EngineError::Transport("reset".into()));

        let id = engine
            .create_container(&cancel(), "web_1", spec("busybox"))
            .await
            .unwrap();
        assert!(engine.start_container(&cancel(), &id).await.is_err());
        assert!(engine.start_container(&cancel(), &id).await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let engine = InMemoryEngine::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .list_containers(&token, &LabelFilter::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
