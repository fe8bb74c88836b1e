//! The per-service state machine: verbs against a service's containers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::container::ContainerHandle;
use super::convert::{self, ConvertInputs};
use super::labels;
use super::naming::ContainerNamer;
use super::ProjectView;
use crate::config::{CommandLine, ServiceConfig};
use crate::engine::{
    with_transient_retry, BuildRequest, EngineError, LogChunk, LogsOptions, NetworkAttachment,
};
use crate::error::{Error, Result};
use crate::events::{Action, Event, Flank};
use crate::hash;
use crate::project::options::{
    BuildOptions, CreateOptions, DeleteOptions, RunOptions, UpOptions,
};

/// Which containers of the service an enumeration returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerSelection {
    /// Long-running replicas only; the default for lifecycle verbs.
    Replicas,
    /// Only `run` one-offs.
    OneOff,
    /// Everything the service owns.
    All,
}

/// A named log stream of one container.
pub struct ContainerLogs {
    pub container: String,
    pub stream: BoxStream<'static, std::result::Result<LogChunk, EngineError>>,
}

/// Executes lifecycle verbs for a single service.
pub struct ServiceRuntime {
    config: Arc<ServiceConfig>,
    view: ProjectView,
    /// Serialises ordinal allocation so two replicas cannot claim the same
    /// number inside one runtime.
    naming_lock: tokio::sync::Mutex<()>,
}

impl ServiceRuntime {
    pub fn new(config: Arc<ServiceConfig>, view: ProjectView) -> Self {
        ServiceRuntime {
            config,
            view,
            naming_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The current configuration fingerprint for drift detection.
    pub fn fingerprint(&self) -> String {
        hash::service_fingerprint(&self.config.name, &self.config)
    }

    fn image_name(&self) -> String {
        self.config.image_name(&self.view.project)
    }

    /// Enumerate this service's containers from the engine.
    pub async fn containers(
        &self,
        cancel: &CancellationToken,
        selection: ContainerSelection,
    ) -> Result<Vec<ContainerHandle>> {
        let filter = labels::service_filter(&self.view.project, &self.config.name);
        let summaries = self
            .view
            .engine
            .list_containers(cancel, &filter, true)
            .await?;

        let mut handles = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let details = self
                .view
                .engine
                .inspect_container(cancel, &summary.id)
                .await?;
            let handle = ContainerHandle::new(Arc::clone(&self.view.engine), details);
            let keep = match selection {
                ContainerSelection::Replicas => !handle.is_one_off(),
                ContainerSelection::OneOff => handle.is_one_off(),
                ContainerSelection::All => true,
            };
            if keep {
                handles.push(handle);
            }
        }
        handles.sort_by_key(|h| h.number().unwrap_or(u32::MAX));
        Ok(handles)
    }

    /// Run `action` against every handle in parallel. Errors are collected;
    /// the last one is returned after all replicas finish.
    async fn each_container<F, Fut>(&self, handles: Vec<ContainerHandle>, action: F) -> Result<()>
    where
        F: Fn(ContainerHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let results = join_all(handles.into_iter().map(|handle| {
            let name = handle.name().to_string();
            let fut = action(handle);
            async move { (name, fut.await) }
        }))
        .await;

        let mut last_error = None;
        for (name, result) in results {
            if let Err(err) = result {
                warn!(container = %name, error = %err, "container operation failed");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Image handling
    // ------------------------------------------------------------------

    /// Make sure the service's image exists: inspect, else build, else
    /// pull.
    pub async fn ensure_image(&self, cancel: &CancellationToken, no_build: bool) -> Result<()> {
        let image = self.image_name();
        if self.view.engine.inspect_image(cancel, &image).await.is_ok() {
            return Ok(());
        }

        if let Some(build) = &self.config.build {
            if no_build {
                return Err(Error::ImageUnavailable {
                    service: self.config.name.clone(),
                    reason: format!("image {image:?} needs to be built, but no-build was given"),
                });
            }
            debug!(service = %self.config.name, context = %build.context, "building missing image");
            return self.build(cancel, BuildOptions::default()).await;
        }

        self.pull(cancel).await
    }

    /// Pull the configured image. Build-only services are skipped.
    pub async fn pull(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(image) = self.config.image.clone() else {
            return Ok(());
        };
        info!(service = %self.config.name, image = %image, "pulling image");
        with_transient_retry(|| {
            let image = image.clone();
            async move { self.view.engine.pull_image(cancel, &image, None).await }
        })
        .await
        .map_err(|e| Error::ImageUnavailable {
            service: self.config.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Build the service image and tag it `<project>_<service>`.
    pub async fn build(&self, cancel: &CancellationToken, options: BuildOptions) -> Result<()> {
        let Some(build) = &self.config.build else {
            return Err(Error::InvalidManifest(format!(
                "services.{}: no build context configured",
                self.config.name
            )));
        };

        let context_dir = self
            .view
            .base_dir
            .join(&build.context)
            .to_string_lossy()
            .into_owned();
        let request = BuildRequest {
            context_dir,
            dockerfile: build.dockerfile.clone(),
            args: build.args.0.clone(),
            no_cache: options.no_cache,
            pull: options.pull,
            force_rm: options.force_rm,
        };
        let tag = self.image_name();
        info!(service = %self.config.name, tag = %tag, "building image");
        self.view
            .engine
            .build_image(cancel, &tag, &request)
            .await
            .map_err(|e| Error::ImageUnavailable {
                service: self.config.name.clone(),
                reason: e.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Drift detection and recreation
    // ------------------------------------------------------------------

    /// A container is out of sync when its stored fingerprint differs from
    /// the current one, or its image no longer matches the resolved image
    /// id. A missing image means we cannot tell; the container is kept.
    pub async fn out_of_sync(
        &self,
        cancel: &CancellationToken,
        handle: &ContainerHandle,
    ) -> Result<bool> {
        let expected = self.fingerprint();
        if handle.config_hash() != Some(expected.as_str()) {
            debug!(
                container = handle.name(),
                "config hash drifted, marking out of sync"
            );
            return Ok(true);
        }

        match self
            .view
            .engine
            .inspect_image(cancel, &self.image_name())
            .await
        {
            Ok(image) => {
                if image.id != handle.details().image_id {
                    debug!(container = handle.name(), "image id drifted");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(EngineError::ImageNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn recreate_if_needed(
        &self,
        cancel: &CancellationToken,
        handle: ContainerHandle,
        options: CreateOptions,
        start_replacement: bool,
    ) -> Result<ContainerHandle> {
        if options.no_recreate {
            return Ok(handle);
        }
        let drifted = self.out_of_sync(cancel, &handle).await?;
        if options.force_recreate || drifted {
            info!(service = %self.config.name, container = handle.name(), "recreating container");
            return self.recreate(cancel, handle, start_replacement).await;
        }
        Ok(handle)
    }

    /// The recreate protocol: rename the old container out of the way,
    /// create a replacement under the original name inheriting the old
    /// volume binds, optionally start it, then remove the old container
    /// with its volumes preserved.
    async fn recreate(
        &self,
        cancel: &CancellationToken,
        old: ContainerHandle,
        start_replacement: bool,
    ) -> Result<ContainerHandle> {
        let original_name = old.name().to_string();
        let parked_name = format!("{original_name}_{}", old.short_id());
        debug!(from = %original_name, to = %parked_name, "renaming old container");
        old.rename(cancel, &parked_name).await?;

        let mut namer = ContainerNamer::fixed(&original_name);
        let number = old.number().unwrap_or(1);
        let inherited = old.details().binds.clone();
        let mut replacement = self
            .create_container(cancel, &mut namer, Some(number), inherited, None, false)
            .await?;

        if start_replacement {
            self.start_with_events(cancel, &replacement).await?;
            replacement = replacement.refreshed(cancel).await?;
        }

        if old.is_running() {
            old.stop(cancel, Duration::from_secs(10)).await?;
        }
        old.remove(cancel, false, false).await?;
        debug!(container = %original_name, "old container removed");
        Ok(replacement)
    }

    // ------------------------------------------------------------------
    // Container creation
    // ------------------------------------------------------------------

    /// Resolve `links` entries to engine-level `container:alias` pairs.
    async fn resolve_links(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        for link in &self.config.links {
            let (target, alias) = match link.split_once(':') {
                Some((target, alias)) => (target, alias),
                None => (link.as_str(), link.as_str()),
            };
            let filter = labels::service_filter(&self.view.project, target);
            let summaries = self
                .view
                .engine
                .list_containers(cancel, &filter, true)
                .await?;
            for summary in &summaries {
                let entry = format!("{}:{alias}", summary.name);
                if !resolved.contains(&entry) {
                    resolved.push(entry);
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve `volumes_from` entries to container names.
    async fn resolve_volumes_from(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        for entry in &self.config.volumes_from {
            if let Some(container) = entry.strip_prefix("container:") {
                resolved.push(container.to_string());
                continue;
            }
            let (target, mode) = match entry.rsplit_once(':') {
                Some((target, mode)) if mode == "ro" || mode == "rw" => (target, Some(mode)),
                _ => (entry.as_str(), None),
            };
            let filter = labels::service_filter(&self.view.project, target);
            for summary in self
                .view
                .engine
                .list_containers(cancel, &filter, true)
                .await?
            {
                resolved.push(match mode {
                    Some(mode) => format!("{}:{mode}", summary.name),
                    None => summary.name,
                });
            }
        }
        Ok(resolved)
    }

    /// Resolve a `service:<name>` namespace reference to the engine-level
    /// `container:<name>` form.
    async fn resolve_namespace(
        &self,
        cancel: &CancellationToken,
        mode: Option<&crate::config::NamespaceMode>,
        what: &str,
    ) -> Result<Option<String>> {
        let Some(mode) = mode else { return Ok(None) };
        let Some(target) = mode.service_ref() else {
            return Ok(Some(mode.as_str().to_string()));
        };

        let filter = labels::service_filter(&self.view.project, target);
        let summaries = self
            .view
            .engine
            .list_containers(cancel, &filter, true)
            .await?;
        match summaries.first() {
            Some(summary) => Ok(Some(format!("container:{}", summary.name))),
            None => Err(Error::ConflictingState(format!(
                "service '{target}' has no containers to share its {what} namespace with '{}'",
                self.config.name
            ))),
        }
    }

    /// Create one container, retrying with the next ordinal when the name
    /// is already claimed engine-side.
    async fn create_container(
        &self,
        cancel: &CancellationToken,
        namer: &mut ContainerNamer,
        number_override: Option<u32>,
        inherited_binds: Vec<String>,
        config_override: Option<&ServiceConfig>,
        one_off: bool,
    ) -> Result<ContainerHandle> {
        let links = self.resolve_links(cancel).await?;
        let volumes_from = self.resolve_volumes_from(cancel).await?;
        let network_mode = self
            .resolve_namespace(cancel, self.config.network_mode.as_ref(), "network")
            .await?;
        let ipc_mode = self
            .resolve_namespace(cancel, self.config.ipc.as_ref(), "ipc")
            .await?;

        let effective = match config_override {
            Some(override_config) => {
                let mut merged = (*self.config).clone();
                merged.command = override_config.command.clone();
                merged.tty = override_config.tty;
                merged.stdin_open = override_config.stdin_open;
                merged
            }
            None => (*self.config).clone(),
        };
        let fingerprint = hash::service_fingerprint(&self.config.name, &self.config);

        const MAX_NAME_ATTEMPTS: u32 = 64;
        let mut attempts = 0;
        loop {
            let (name, number) = namer.next();
            let number = number_override.unwrap_or(number);

            let owned = labels::owned_labels(
                &self.view.project,
                &self.config.name,
                &fingerprint,
                number,
                one_off,
            );
            let mut spec = convert::create_spec(
                &effective,
                ConvertInputs {
                    project: &self.view.project,
                    base_dir: &self.view.base_dir,
                    lookup: self.view.lookup.as_ref(),
                    labels: owned,
                    links: links.clone(),
                    volumes_from: volumes_from.clone(),
                    network_mode: network_mode.clone(),
                    ipc_mode: ipc_mode.clone(),
                },
            )?;
            for bind in &inherited_binds {
                if !spec.host.binds.contains(bind) {
                    spec.host.binds.push(bind.clone());
                }
            }

            self.view.bus.publish(Event::container(
                Action::Create,
                Flank::Start,
                &self.config.name,
                &name,
            ));

            match self
                .view
                .engine
                .create_container(cancel, &name, spec)
                .await
            {
                Ok(id) => {
                    self.view.bus.publish(Event::container(
                        Action::Create,
                        Flank::Done,
                        &self.config.name,
                        &name,
                    ));
                    let details = self.view.engine.inspect_container(cancel, &id).await?;
                    debug!(container = %name, id = %details.id, "created container");
                    return Ok(ContainerHandle::new(
                        Arc::clone(&self.view.engine),
                        details,
                    ));
                }
                Err(EngineError::Conflict(reason))
                    if matches!(namer, ContainerNamer::Ordinal { .. })
                        && attempts < MAX_NAME_ATTEMPTS =>
                {
                    // Another replica claimed the ordinal between our scan
                    // and the create; move on to the next number.
                    debug!(container = %name, %reason, "name collision, retrying with next ordinal");
                    attempts += 1;
                    continue;
                }
                Err(e) => {
                    self.view.bus.publish(
                        Event::container(
                            Action::Create,
                            Flank::Start,
                            &self.config.name,
                            &name,
                        )
                        .with_error(&e),
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Connect a container to its declared networks, skipping the ones it
    /// is already attached to.
    async fn connect_networks(
        &self,
        cancel: &CancellationToken,
        handle: &ContainerHandle,
        one_off: bool,
    ) -> Result<()> {
        for binding in &self.config.networks.0 {
            if handle.details().networks.contains(&binding.name) {
                continue;
            }
            let mut aliases = Vec::new();
            if !one_off {
                aliases.push(self.config.name.clone());
            }
            aliases.extend(binding.aliases.iter().cloned());

            self.view
                .engine
                .connect_network(
                    cancel,
                    &binding.name,
                    handle.id(),
                    NetworkAttachment {
                        aliases,
                        links: Vec::new(),
                        ipv4_address: binding.ipv4_address.clone(),
                        ipv6_address: binding.ipv6_address.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn start_with_events(
        &self,
        cancel: &CancellationToken,
        handle: &ContainerHandle,
    ) -> Result<()> {
        self.view.bus.publish(Event::container(
            Action::Start,
            Flank::Start,
            &self.config.name,
            handle.name(),
        ));
        match handle.start(cancel).await {
            Ok(()) => {
                self.view.bus.publish(Event::container(
                    Action::Start,
                    Flank::Done,
                    &self.config.name,
                    handle.name(),
                ));
                Ok(())
            }
            Err(e) => {
                self.view.bus.publish(
                    Event::container(Action::Start, Flank::Start, &self.config.name, handle.name())
                        .with_error(&e),
                );
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    /// Ensure the image exists and every replica matches the current
    /// config, creating or recreating containers as the options allow.
    pub async fn create(&self, cancel: &CancellationToken, options: CreateOptions) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.ensure_image(cancel, options.no_build).await?;

        if containers.is_empty() {
            let _guard = self.naming_lock.lock().await;
            let mut namer = self.replica_namer(cancel).await?;
            self.create_container(cancel, &mut namer, None, Vec::new(), None, false)
                .await?;
            return Ok(());
        }

        self.each_container(containers, |handle| async move {
            self.recreate_if_needed(cancel, handle, options, false)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Create (if needed), attach networks, and start everything that is
    /// not running.
    pub async fn up(&self, cancel: &CancellationToken, options: UpOptions) -> Result<()> {
        let mut containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;

        if containers.is_empty() || !options.create.no_recreate {
            self.ensure_image(cancel, options.create.no_build).await?;
        }

        if containers.is_empty() {
            let _guard = self.naming_lock.lock().await;
            let mut namer = self.replica_namer(cancel).await?;
            let created = self
                .create_container(cancel, &mut namer, None, Vec::new(), None, false)
                .await?;
            containers = vec![created];
        }

        let create_options = options.create;
        self.each_container(containers, |handle| async move {
            // Replacements are started before the old container is
            // removed, so anonymous volumes hand over without a gap.
            let handle = self
                .recreate_if_needed(cancel, handle, create_options, true)
                .await?;
            self.connect_networks(cancel, &handle, false).await?;
            if !handle.is_running() {
                self.start_with_events(cancel, &handle).await?;
            }
            Ok(())
        })
        .await
    }

    /// Start every stopped container without creating anything.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            self.connect_networks(cancel, &handle, false).await?;
            if !handle.is_running() {
                self.start_with_events(cancel, &handle).await?;
            }
            Ok(())
        })
        .await
    }

    /// SIGTERM then SIGKILL after `timeout`, for each running container.
    pub async fn stop(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            if handle.is_running() {
                handle.stop(cancel, timeout).await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn restart(&self, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            handle.restart(cancel, timeout).await?;
            Ok(())
        })
        .await
    }

    pub async fn kill(&self, cancel: &CancellationToken, signal: &str) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            if handle.is_running() {
                handle.kill(cancel, signal).await?;
            }
            Ok(())
        })
        .await
    }

    /// Pause running containers; already-paused ones are left alone.
    pub async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            if handle.is_running() && !handle.is_paused() {
                handle.pause(cancel).await?;
            }
            Ok(())
        })
        .await
    }

    /// Unpause paused containers; others are left alone.
    pub async fn unpause(&self, cancel: &CancellationToken) -> Result<()> {
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            if handle.is_paused() {
                handle.unpause(cancel).await?;
            }
            Ok(())
        })
        .await
    }

    /// Remove this service's containers. Running containers are skipped
    /// unless `remove_running` forces them out.
    pub async fn delete(&self, cancel: &CancellationToken, options: DeleteOptions) -> Result<()> {
        let containers = self.containers(cancel, ContainerSelection::All).await?;
        self.each_container(containers, |handle| async move {
            if handle.is_running() && !options.remove_running {
                debug!(container = handle.name(), "still running, skipping removal");
                return Ok(());
            }
            handle
                .remove(cancel, options.remove_running, options.remove_volumes)
                .await?;
            Ok(())
        })
        .await
    }

    /// Converge on `target` replicas: create missing ordinals, or stop and
    /// remove the highest ordinals first when shrinking.
    pub async fn scale(
        &self,
        cancel: &CancellationToken,
        target: usize,
        timeout: Duration,
    ) -> Result<()> {
        if self.config.container_name.is_some() && target > 1 {
            return Err(Error::ConflictingState(format!(
                "service '{}' pins container_name {:?}; each container needs a unique name, so it cannot scale beyond 1",
                self.config.name,
                self.config.container_name.as_deref().unwrap_or_default()
            )));
        }

        if target > 1 && self.publishes_host_port() {
            warn!(
                service = %self.config.name,
                "service publishes a host port; multiple replicas on one host will clash"
            );
        }

        let mut containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;

        if containers.len() > target {
            // `containers` is sorted by ordinal; shed the tail, highest
            // ordinal first.
            let mut surplus = containers.split_off(target);
            surplus.reverse();
            for handle in surplus {
                info!(container = handle.name(), "scaling down");
                if handle.is_running() {
                    handle.stop(cancel, timeout).await?;
                }
                handle.remove(cancel, false, false).await?;
            }
        }

        if containers.len() < target {
            self.ensure_image(cancel, false).await?;
            let _guard = self.naming_lock.lock().await;
            let mut namer = self.replica_namer(cancel).await?;
            for _ in containers.len()..target {
                self.create_container(cancel, &mut namer, None, Vec::new(), None, false)
                    .await?;
            }
        }

        // Bring every replica up without recreating.
        let containers = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?;
        self.each_container(containers, |handle| async move {
            self.connect_networks(cancel, &handle, false).await?;
            if !handle.is_running() {
                self.start_with_events(cancel, &handle).await?;
            }
            Ok(())
        })
        .await
    }

    /// Run a one-off container with an overridden command. Returns the
    /// exit code when attached, 0 when detached.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        command: Vec<String>,
        options: RunOptions,
    ) -> Result<i64> {
        self.ensure_image(cancel, false).await?;

        let override_config = ServiceConfig {
            command: Some(CommandLine::from(command)),
            tty: true,
            stdin_open: true,
            ..ServiceConfig::default()
        };

        let handle = {
            let _guard = self.naming_lock.lock().await;
            let used: Vec<u32> = self
                .containers(cancel, ContainerSelection::OneOff)
                .await?
                .iter()
                .filter_map(ContainerHandle::number)
                .collect();
            let mut namer =
                ContainerNamer::ordinal(&self.view.project, &self.config.name, true, used);
            self.create_container(
                cancel,
                &mut namer,
                None,
                Vec::new(),
                Some(&override_config),
                true,
            )
            .await?
        };

        self.connect_networks(cancel, &handle, true).await?;
        self.start_with_events(cancel, &handle).await?;

        if options.detached {
            info!(container = handle.name(), "one-off started detached");
            return Ok(0);
        }

        let code = handle.wait(cancel).await?;
        debug!(container = handle.name(), code, "one-off finished");
        Ok(code)
    }

    /// Collect the log streams of every container of the service.
    pub async fn logs(
        &self,
        cancel: &CancellationToken,
        options: LogsOptions,
    ) -> Result<Vec<ContainerLogs>> {
        let containers = self.containers(cancel, ContainerSelection::All).await?;
        let mut streams = Vec::with_capacity(containers.len());
        for handle in containers {
            let label = match handle.number() {
                Some(number) => format!("{}_{number}", self.config.name),
                None => handle.name().to_string(),
            };
            let stream = handle.logs(cancel, options.clone()).await?;
            streams.push(ContainerLogs {
                container: label,
                stream,
            });
        }
        Ok(streams)
    }

    /// Whether any `ports:` entry binds a host port.
    fn publishes_host_port(&self) -> bool {
        self.config
            .ports
            .iter()
            .filter_map(|spec| crate::config::PortSpec::parse(spec).ok())
            .any(|spec| spec.host_port.is_some())
    }

    /// Ordinal namer seeded with the numbers currently in use.
    async fn replica_namer(&self, cancel: &CancellationToken) -> Result<ContainerNamer> {
        if let Some(fixed) = &self.config.container_name {
            return Ok(ContainerNamer::fixed(fixed));
        }
        let used: Vec<u32> = self
            .containers(cancel, ContainerSelection::Replicas)
            .await?
            .iter()
            .filter_map(ContainerHandle::number)
            .collect();
        Ok(ContainerNamer::ordinal(
            &self.view.project,
            &self.config.name,
            false,
            used,
        ))
    }
}
