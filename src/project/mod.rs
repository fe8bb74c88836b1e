//! The project engine: lifecycle verbs fanned out across services.
//!
//! A [`Project`] owns the merged manifest, the dependency graph, the
//! engine client and the event bus. Each verb computes its effective
//! service set (dependencies for bring-up verbs, dependents for teardown
//! verbs), spawns one task per service with `watch`-channel barriers on
//! the dependency edges, and runs the per-service action under a bounded
//! parallelism limit. Per-service failures never abort independent
//! services: everything runs to completion and the errors are returned
//! either singly or aggregated.

pub mod executor;
pub mod options;
pub mod phase;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::{
    DiskResolver, EnvironmentLookup, FileResolver, ManifestLoader, MapEnv, Manifest, ProcessEnv,
};
use crate::engine::{EngineClient, EngineEvent, EngineError, LogsOptions, NetworkSpec};
use crate::error::{Error, Result};
use crate::events::{Action, Event, EventBus, Flank, DEFAULT_BUS_CAPACITY};
use crate::graph::DependencyGraph;
use crate::runtime::{labels, ContainerHandle, ProjectView, ServiceRuntime};
use crate::runtime::service::{ContainerLogs, ContainerSelection};

use executor::{wait_for_outcome, ExecState, Outcome, ServiceExecutor};
use options::{
    BuildOptions, CreateOptions, DeleteOptions, DownOptions, RunOptions, UpOptions,
    DEFAULT_STOP_TIMEOUT,
};
use phase::Phase;

/// Default cap on concurrently executing service actions.
pub const DEFAULT_PARALLELISM: usize = 64;

/// Reload rounds allowed before the engine refuses to loop further.
const MAX_RELOAD_ROUNDS: u32 = 3;

/// Which extra services a verb pulls into its effective set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closure {
    None,
    Dependencies,
    Dependents,
}

/// Which way the barriers point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Dependencies finish before dependents run (up, start, create).
    Forward,
    /// Dependents finish before dependencies run (stop, down, delete).
    Reverse,
    /// No barriers (pull, build, pause).
    Unordered,
}

type ActionFactory =
    Arc<dyn Fn(Arc<ServiceRuntime>, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builder for [`Project`].
pub struct ProjectBuilder {
    name: String,
    buffers: Vec<(String, Vec<u8>)>,
    paths: Vec<PathBuf>,
    base_dir: PathBuf,
    engine: Option<Arc<dyn EngineClient>>,
    lookup: Option<Arc<dyn EnvironmentLookup>>,
    resolver: Option<Box<dyn FileResolver>>,
    parallelism: usize,
    bus_capacity: usize,
    reload_callback: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl ProjectBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ProjectBuilder {
            name: name.into(),
            buffers: Vec::new(),
            paths: Vec::new(),
            base_dir: PathBuf::from("."),
            engine: None,
            lookup: None,
            resolver: None,
            parallelism: DEFAULT_PARALLELISM,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            reload_callback: None,
        }
    }

    /// Add an in-memory manifest buffer; buffers merge left-to-right.
    pub fn file_bytes(mut self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.buffers.push((id.into(), bytes.into()));
        self
    }

    /// Add a manifest path; paths merge left-to-right.
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Use the default file discovery in `dir` (`docker-compose.yml` plus
    /// the override file when present).
    pub fn discover_in(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let files = ManifestLoader::find_default_files(&dir)?;
        self.base_dir = dir;
        self.paths.extend(files);
        Ok(self)
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn engine(mut self, engine: Arc<dyn EngineClient>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn environment(mut self, lookup: Arc<dyn EnvironmentLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Resolver for `extends` references from in-memory buffers.
    pub fn resolver(mut self, resolver: Box<dyn FileResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn parallelism(mut self, limit: usize) -> Self {
        self.parallelism = limit.max(1);
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Callback consulted when an action raises the reload sentinel;
    /// returning true re-runs the affected services.
    pub fn reload_callback(mut self, callback: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.reload_callback = Some(callback);
        self
    }

    /// Parse, interpolate, validate and merge the manifests, build the
    /// dependency graph, and assemble the project. Fatal configuration
    /// errors surface here, before any engine mutation.
    pub fn build(self) -> Result<Project> {
        let engine = self
            .engine
            .ok_or_else(|| Error::ConflictingState("project needs an engine client".into()))?;
        // Default interpolation environment: the process env, with a
        // `.env` file next to the first manifest supplying fallbacks.
        let lookup: Arc<dyn EnvironmentLookup> = match self.lookup {
            Some(lookup) => lookup,
            None => match self.paths.first() {
                Some(first) => Arc::new(crate::config::env_loader::DotEnvLookup::beside(first)?),
                None => Arc::new(ProcessEnv),
            },
        };

        // When loading from paths, relative references (env_file, build
        // contexts) resolve against the first manifest's directory unless
        // the caller pinned a base explicitly.
        let base_dir = if self.base_dir == PathBuf::from(".") {
            self.paths
                .first()
                .and_then(|p| p.parent())
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(|| self.base_dir.clone())
        } else {
            self.base_dir.clone()
        };

        let manifest = if !self.paths.is_empty() {
            ManifestLoader::load_paths(&self.paths, lookup.as_ref())?
        } else if !self.buffers.is_empty() {
            let buffers: Vec<(&str, &[u8])> = self
                .buffers
                .iter()
                .map(|(id, bytes)| (id.as_str(), bytes.as_slice()))
                .collect();
            let disk;
            let resolver: &dyn FileResolver = match &self.resolver {
                Some(resolver) => resolver.as_ref(),
                None => {
                    disk = DiskResolver::new(base_dir.clone());
                    &disk
                }
            };
            ManifestLoader::load_buffers(&buffers, lookup.as_ref(), resolver)?
        } else {
            return Err(Error::InvalidManifest(
                "no manifest files or buffers supplied".into(),
            ));
        };

        // A dependency cycle is a configuration error: surface it the same
        // way as any other invalid manifest, before any engine mutation.
        let graph = DependencyGraph::from_manifest(&manifest).map_err(|e| match e {
            Error::CircularDependency(path) => {
                Error::InvalidManifest(format!("cycle: {}", path.join(" -> ")))
            }
            other => other,
        })?;
        let bus = EventBus::new(self.bus_capacity);

        let view = ProjectView {
            project: self.name.clone(),
            base_dir: base_dir.clone(),
            engine: Arc::clone(&engine),
            bus: bus.clone(),
            lookup: Arc::clone(&lookup),
        };

        let runtimes = manifest
            .services
            .iter()
            .map(|(name, config)| {
                let runtime = ServiceRuntime::new(Arc::new(config.clone()), view.clone());
                bus.publish(Event::service(Action::Add, Flank::Done, name.clone()));
                (name.clone(), Arc::new(runtime))
            })
            .collect();

        Ok(Project {
            name: self.name,
            manifest,
            graph,
            engine,
            bus,
            lookup,
            base_dir,
            runtimes,
            cancel: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(self.parallelism)),
            reload_callback: self.reload_callback,
        })
    }
}

/// A named collection of services loaded from one or more manifests.
pub struct Project {
    name: String,
    manifest: Manifest,
    graph: DependencyGraph,
    engine: Arc<dyn EngineClient>,
    bus: EventBus,
    #[allow(dead_code)]
    lookup: Arc<dyn EnvironmentLookup>,
    #[allow(dead_code)]
    base_dir: PathBuf,
    runtimes: BTreeMap<String, Arc<ServiceRuntime>>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    reload_callback: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Project {
    pub fn builder(name: impl Into<String>) -> ProjectBuilder {
        ProjectBuilder::new(name)
    }

    /// Convenience constructor over in-memory manifests and an in-memory
    /// environment, mostly for tests and embedding.
    pub fn from_buffers(
        name: &str,
        buffers: &[(&str, &str)],
        engine: Arc<dyn EngineClient>,
        env: &[(&str, &str)],
    ) -> Result<Project> {
        let mut builder = Project::builder(name)
            .engine(engine)
            .environment(Arc::new(MapEnv::new(env.iter().copied())));
        for (id, content) in buffers {
            builder = builder.file_bytes(*id, content.as_bytes());
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn runtime(&self, service: &str) -> Result<Arc<ServiceRuntime>> {
        self.runtimes
            .get(service)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }

    /// Cancel every in-flight action on this project.
    pub fn cancel_operations(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    /// Create missing containers, recreate drifted ones, attach networks
    /// and start everything, dependencies first.
    pub async fn up(&self, options: UpOptions, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Up)
            .run(|| async {
                self.ensure_networks().await?;
                self.perform(
                    Action::Up,
                    services,
                    Closure::Dependencies,
                    Direction::Forward,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.up(&cancel, options).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Create or refresh containers without starting them.
    pub async fn create(&self, options: CreateOptions, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Create)
            .run(|| async {
                self.perform(
                    Action::Create,
                    services,
                    Closure::Dependencies,
                    Direction::Forward,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.create(&cancel, options).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Start existing stopped containers, dependencies first.
    pub async fn start(&self, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Start)
            .run(|| async {
                self.perform(
                    Action::Start,
                    services,
                    Closure::Dependencies,
                    Direction::Forward,
                    Arc::new(|rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.start(&cancel).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Stop running containers, dependents before their dependencies.
    pub async fn stop(&self, timeout: Option<Duration>, services: &[&str]) -> Result<()> {
        let timeout = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        Phase::project(&self.bus, Action::Stop)
            .run(|| async {
                self.perform(
                    Action::Stop,
                    services,
                    Closure::Dependents,
                    Direction::Reverse,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.stop(&cancel, timeout).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Stop and remove containers, dependents first.
    pub async fn down(&self, options: DownOptions, services: &[&str]) -> Result<()> {
        let timeout = options.timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        let remove_volumes = options.remove_volumes;
        Phase::project(&self.bus, Action::Down)
            .run(|| async {
                self.perform(
                    Action::Down,
                    services,
                    Closure::Dependents,
                    Direction::Reverse,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move {
                            rt.stop(&cancel, timeout).await?;
                            rt.delete(
                                &cancel,
                                DeleteOptions {
                                    remove_volumes,
                                    remove_running: false,
                                },
                            )
                            .await
                        }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Remove containers; running ones are skipped unless forced.
    pub async fn delete(&self, options: DeleteOptions, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Delete)
            .run(|| async {
                self.perform(
                    Action::Delete,
                    services,
                    Closure::Dependents,
                    Direction::Reverse,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.delete(&cancel, options).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Send a signal to every running container, dependents first.
    pub async fn kill(&self, signal: &str, services: &[&str]) -> Result<()> {
        let signal = signal.to_string();
        Phase::project(&self.bus, Action::Kill)
            .run(|| async {
                let signal = signal.clone();
                self.perform(
                    Action::Kill,
                    services,
                    Closure::Dependents,
                    Direction::Reverse,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        let signal = signal.clone();
                        Box::pin(async move { rt.kill(&cancel, &signal).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    pub async fn restart(&self, timeout: Option<Duration>, services: &[&str]) -> Result<()> {
        let timeout = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        Phase::project(&self.bus, Action::Restart)
            .run(|| async {
                self.perform(
                    Action::Restart,
                    services,
                    Closure::None,
                    Direction::Forward,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.restart(&cancel, timeout).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    pub async fn pause(&self, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Pause)
            .run(|| async {
                self.perform(
                    Action::Pause,
                    services,
                    Closure::None,
                    Direction::Unordered,
                    Arc::new(|rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.pause(&cancel).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    pub async fn unpause(&self, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Unpause)
            .run(|| async {
                self.perform(
                    Action::Unpause,
                    services,
                    Closure::None,
                    Direction::Unordered,
                    Arc::new(|rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.unpause(&cancel).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Pull every service image that names one.
    pub async fn pull(&self, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Pull)
            .run(|| async {
                self.perform(
                    Action::Pull,
                    services,
                    Closure::None,
                    Direction::Unordered,
                    Arc::new(|rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move { rt.pull(&cancel).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Build every service with a build context.
    pub async fn build(&self, options: BuildOptions, services: &[&str]) -> Result<()> {
        Phase::project(&self.bus, Action::Build)
            .run(|| async {
                self.perform(
                    Action::Build,
                    services,
                    Closure::None,
                    Direction::Unordered,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        Box::pin(async move {
                            if rt.config().has_build() {
                                rt.build(&cancel, options).await
                            } else {
                                Ok(())
                            }
                        }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Converge the named services onto the requested replica counts.
    pub async fn scale(
        &self,
        counts: &BTreeMap<String, usize>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let timeout = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        let counts = counts.clone();
        let services: Vec<&str> = counts.keys().map(String::as_str).collect();
        Phase::project(&self.bus, Action::Scale)
            .run(|| async {
                let counts = counts.clone();
                self.perform(
                    Action::Scale,
                    &services,
                    Closure::None,
                    Direction::Forward,
                    Arc::new(move |rt: Arc<ServiceRuntime>, cancel: CancellationToken| {
                        let target = counts.get(rt.name()).copied().unwrap_or(1);
                        Box::pin(async move { rt.scale(&cancel, target, timeout).await }) as BoxFuture<'static, Result<()>>
                    }),
                )
                .await
            })
            .await
    }

    /// Run a one-off command in a new container of `service`; returns the
    /// exit code (0 when detached).
    pub async fn run(
        &self,
        service: &str,
        command: Vec<String>,
        options: RunOptions,
    ) -> Result<i64> {
        let runtime = self.runtime(service)?;
        let cancel = self.cancel.child_token();
        Phase::service(&self.bus, Action::Run, service)
            .run(|| async move { runtime.run(&cancel, command, options).await })
            .instrument(tracing::info_span!("run", service = %service))
            .await
    }

    /// Collect the log streams of every container of the selected
    /// services.
    pub async fn logs(&self, follow: bool, services: &[&str]) -> Result<Vec<ContainerLogs>> {
        let targets = self.expand_filter(services)?;
        let cancel = self.cancel.child_token();
        let options = LogsOptions {
            follow,
            ..LogsOptions::default()
        };
        let mut all = Vec::new();
        for name in targets {
            let runtime = self.runtime(&name)?;
            all.extend(runtime.logs(&cancel, options.clone()).await?);
        }
        Ok(all)
    }

    /// Current containers per selected service.
    pub async fn containers(
        &self,
        services: &[&str],
    ) -> Result<Vec<(String, Vec<ContainerHandle>)>> {
        let targets = self.expand_filter(services)?;
        let cancel = self.cancel.child_token();
        let mut out = Vec::with_capacity(targets.len());
        for name in targets {
            let runtime = self.runtime(&name)?;
            let handles = runtime
                .containers(&cancel, ContainerSelection::All)
                .await?;
            out.push((name, handles));
        }
        Ok(out)
    }

    /// Host-side address of a published container port: `port("web", 1,
    /// "tcp", 80)` answers where replica 1 of `web` publishes 80/tcp.
    pub async fn port(
        &self,
        service: &str,
        index: u32,
        protocol: &str,
        container_port: u16,
    ) -> Result<Option<String>> {
        let runtime = self.runtime(service)?;
        let cancel = self.cancel.child_token();
        let containers = runtime
            .containers(&cancel, ContainerSelection::Replicas)
            .await?;
        let Some(handle) = containers.iter().find(|h| h.number() == Some(index)) else {
            return Err(Error::ConflictingState(format!(
                "service '{service}' has no container number {index}"
            )));
        };

        Ok(handle
            .details()
            .port_bindings
            .iter()
            .find(|b| b.container_port == container_port && b.protocol == protocol)
            .and_then(|b| {
                b.host_port.map(|port| {
                    format!("{}:{port}", b.host_ip.as_deref().unwrap_or("0.0.0.0"))
                })
            }))
    }

    /// Stream raw engine events for this project's containers.
    pub async fn engine_events(
        &self,
    ) -> Result<BoxStream<'static, std::result::Result<EngineEvent, EngineError>>> {
        let cancel = self.cancel.child_token();
        let filter = labels::project_filter(&self.name);
        Ok(self.engine.events(&cancel, &filter).await?)
    }

    // ------------------------------------------------------------------
    // Execution machinery
    // ------------------------------------------------------------------

    /// Create the project's declared (non-external) networks.
    async fn ensure_networks(&self) -> Result<()> {
        let cancel = self.cancel.child_token();
        for (name, network) in &self.manifest.networks {
            if network.external {
                continue;
            }
            self.engine
                .create_network(
                    &cancel,
                    name,
                    NetworkSpec {
                        driver: network.driver.clone(),
                        options: network.driver_opts.0.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn expand_filter(&self, services: &[&str]) -> Result<Vec<String>> {
        if services.is_empty() {
            return Ok(self.manifest.services.keys().cloned().collect());
        }
        let mut out = Vec::with_capacity(services.len());
        for name in services {
            if !self.manifest.services.contains_key(*name) {
                return Err(Error::ServiceNotFound((*name).to_string()));
            }
            if !out.contains(&(*name).to_string()) {
                out.push((*name).to_string());
            }
        }
        Ok(out)
    }

    /// The effective set for a verb: the filter expanded by its closure,
    /// in manifest order.
    fn effective_set(&self, services: &[&str], closure: Closure) -> Result<Vec<String>> {
        let targets = self.expand_filter(services)?;
        let mut set: HashSet<String> = targets.iter().cloned().collect();
        match closure {
            Closure::None => {}
            Closure::Dependencies => {
                set.extend(self.graph.dependency_closure(&targets));
            }
            Closure::Dependents => {
                set.extend(self.graph.dependent_closure(&targets));
            }
        }
        Ok(self
            .manifest
            .services
            .keys()
            .filter(|name| set.contains(*name))
            .cloned()
            .collect())
    }

    /// Barrier edges for one service, restricted to the executing set.
    fn wait_targets(
        &self,
        name: &str,
        set: &HashSet<String>,
        direction: Direction,
    ) -> Vec<String> {
        match direction {
            Direction::Unordered => Vec::new(),
            Direction::Forward => self
                .graph
                .direct_dependencies(name)
                .iter()
                .map(|edge| edge.target.clone())
                .filter(|target| set.contains(target))
                .collect(),
            Direction::Reverse => self
                .graph
                .direct_dependents(name)
                .iter()
                .filter(|dependent| set.contains(*dependent))
                .cloned()
                .collect(),
        }
    }

    /// Run `action` across the effective service set with dependency
    /// barriers, bounded parallelism, per-service events and the reload
    /// protocol.
    async fn perform(
        &self,
        action: Action,
        services: &[&str],
        closure: Closure,
        direction: Direction,
        factory: ActionFactory,
    ) -> Result<()> {
        let exec_order = self.effective_set(services, closure)?;
        if exec_order.is_empty() {
            return Ok(());
        }
        let exec_set: HashSet<String> = exec_order.iter().cloned().collect();
        debug!(action = action.as_str(), services = ?exec_order, "performing project action");

        let executors: BTreeMap<String, Arc<ServiceExecutor>> = exec_order
            .iter()
            .map(|name| (name.clone(), Arc::new(ServiceExecutor::new(name))))
            .collect();

        let mut outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let mut pending: Vec<String> = exec_order.clone();
        let mut round = 0u32;

        loop {
            let pending_set: HashSet<String> = pending.iter().cloned().collect();
            for name in &exec_order {
                let executor = &executors[name];
                if pending_set.contains(name) {
                    executor.reset_pending();
                } else {
                    executor.reset_done();
                }
            }

            let mut tasks = Vec::with_capacity(pending.len());
            for name in &pending {
                let executor = Arc::clone(&executors[name]);
                let runtime = Arc::clone(&self.runtimes[name]);
                let waits: Vec<(String, tokio::sync::watch::Receiver<ExecState>)> = self
                    .wait_targets(name, &exec_set, direction)
                    .into_iter()
                    .map(|dep| (dep.clone(), executors[&dep].watch()))
                    .collect();
                let phase = Phase::service(&self.bus, action, name.clone());
                let semaphore = Arc::clone(&self.semaphore);
                let factory = Arc::clone(&factory);
                let cancel = self.cancel.child_token();
                let service = name.clone();

                tasks.push(tokio::spawn(
                    async move {
                        for (dep, mut rx) in waits {
                            match wait_for_outcome(&mut rx).await {
                                Outcome::Done => {}
                                Outcome::Restart => {
                                    debug!(service = %service, dependency = %dep, "dependency requested reload");
                                    executor.finish(Outcome::Restart);
                                    return;
                                }
                                Outcome::Failed(_) => {
                                    let err = Error::DependencyFailed {
                                        service: service.clone(),
                                        dependency: dep,
                                    };
                                    phase.skipped(&err);
                                    executor.finish(Outcome::Failed(Arc::new(err)));
                                    return;
                                }
                            }
                        }

                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                executor.finish(Outcome::Failed(Arc::new(Error::Cancelled(
                                    service.clone(),
                                ))));
                                return;
                            }
                        };

                        executor.mark_running();
                        let outcome = match phase.run(|| factory(runtime, cancel)).await {
                            Ok(()) => Outcome::Done,
                            Err(err) if err.is_restart() => Outcome::Restart,
                            Err(err) => Outcome::Failed(Arc::new(err)),
                        };
                        executor.finish(outcome);
                    }
                    .instrument(tracing::info_span!(
                        "service_action",
                        action = action.as_str(),
                        service = %name
                    )),
                ));
            }

            for task in tasks {
                // A panicking task already poisoned its executor channel;
                // surface the panic instead of hanging dependents.
                if let Err(join_err) = task.await {
                    warn!(error = %join_err, "service task aborted");
                }
            }

            let mut restarts = Vec::new();
            for name in &pending {
                let state = executors[name].watch().borrow().clone();
                let outcome = match state {
                    ExecState::Finished(outcome) => outcome,
                    _ => Outcome::Failed(Arc::new(Error::Cancelled(name.clone()))),
                };
                if outcome.is_restart() {
                    restarts.push(name.clone());
                }
                outcomes.insert(name.clone(), outcome);
            }

            if restarts.is_empty() {
                break;
            }

            round += 1;
            if round > MAX_RELOAD_ROUNDS {
                warn!(rounds = round, "reload loop did not settle, giving up");
                for name in restarts {
                    outcomes.insert(
                        name.clone(),
                        Outcome::Failed(Arc::new(Error::ConflictingState(format!(
                            "service '{name}' kept requesting reloads after {MAX_RELOAD_ROUNDS} rounds"
                        )))),
                    );
                }
                break;
            }

            let reload_approved = self.reload_callback.as_ref().is_some_and(|cb| cb());
            if !reload_approved {
                // No callback, or it declined: the sentinel is swallowed and
                // the services are treated as done.
                for name in restarts {
                    outcomes.insert(name, Outcome::Done);
                }
                break;
            }

            info!(services = ?restarts, round, "re-running services after reload");
            self.bus.publish(Event::project(Action::Reload, Flank::Done));
            pending = restarts;
        }

        // Release the executor channels so a sole error can be unwrapped
        // from its Arc instead of being wrapped as a one-element aggregate.
        drop(executors);

        let errors: Vec<Arc<Error>> = exec_order
            .iter()
            .filter_map(|name| match outcomes.remove(name) {
                Some(Outcome::Failed(err)) => Some(err),
                _ => None,
            })
            .collect();

        match Error::aggregate_shared(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
