//! # convoy
//!
//! A library-first, compose-style multi-container orchestrator: a
//! declarative YAML manifest describes a set of named services, their
//! images or build contexts, relationships, networking and runtime
//! parameters; `convoy` materialises that description as live containers
//! on a container engine and drives the full lifecycle across them.
//!
//! ## Pipeline
//!
//! - [`config`] parses manifests with environment interpolation, validates
//!   them per format version, resolves `extends` inheritance and folds
//!   multi-file overlays into one immutable [`config::Manifest`].
//! - [`hash`] fingerprints each service configuration; the fingerprint is
//!   labelled onto every created container and drives drift detection.
//! - [`graph`] derives the dependency graph from `links`, `volumes_from`,
//!   `depends_on` and shared namespaces, rejecting cycles up front.
//! - [`runtime`] maps one service onto engine operations: create, reuse or
//!   recreate containers, scale, run one-offs, stream logs.
//! - [`project`] fans a lifecycle verb out across services with dependency
//!   barriers, bounded parallelism and per-service error collection.
//! - [`events`] carries the `*Start`/`*Done`/`*Failed` event triples to
//!   any number of listeners over a bounded, non-blocking bus.
//! - [`engine`] is the narrow capability trait a container engine adapter
//!   implements; [`engine::InMemoryEngine`] ships as a complete
//!   in-process implementation for tests and dry runs.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use convoy::engine::InMemoryEngine;
//! use convoy::project::options::UpOptions;
//! use convoy::project::Project;
//!
//! # async fn example() -> Result<(), convoy::Error> {
//! let engine = Arc::new(InMemoryEngine::new());
//! let project = Project::builder("myapp")
//!     .engine(engine)
//!     .discover_in(".")?
//!     .build()?;
//!
//! project.up(UpOptions::default(), &[]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! One logical task per service; tasks are independent except for the
//! explicit wait edges from the dependency graph. Within one service,
//! operations run in parallel across its replicas. Every engine call
//! accepts a cancellation token, and cancelling a project propagates to
//! all in-flight work. Configuration is immutable after parse; container
//! state is re-queried from the engine on every pass rather than mirrored
//! locally.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod hash;
pub mod project;
pub mod runtime;

pub use config::{Manifest, ManifestLoader, ServiceConfig};
pub use error::{Error, Result};
pub use events::{Action, Event, EventBus, Flank, Scope};
pub use graph::DependencyGraph;
pub use project::{Project, ProjectBuilder};
pub use runtime::ServiceRuntime;
