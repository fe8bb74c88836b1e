//! Lifecycle events and the in-process fan-out bus.
//!
//! Every project action produces a triple of events per service
//! (`*Start`, then `*Done` or `*Failed`) plus container-level sub-events
//! for creations and starts. Listeners subscribe to the [`EventBus`];
//! publishing never blocks. The bus is a bounded broadcast channel: a
//! subscriber that falls more than the capacity behind loses the oldest
//! events, and every loss is added to the bus-wide [`EventBus::dropped`]
//! counter so back-pressure stays observable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What level of the system an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Project,
    Service,
    Container,
}

/// The lifecycle verb an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Build,
    Create,
    Start,
    Up,
    Pause,
    Unpause,
    Restart,
    Stop,
    Down,
    Kill,
    Delete,
    Pull,
    Run,
    Scale,
    Reload,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Build => "build",
            Action::Create => "create",
            Action::Start => "start",
            Action::Up => "up",
            Action::Pause => "pause",
            Action::Unpause => "unpause",
            Action::Restart => "restart",
            Action::Stop => "stop",
            Action::Down => "down",
            Action::Kill => "kill",
            Action::Delete => "delete",
            Action::Pull => "pull",
            Action::Run => "run",
            Action::Scale => "scale",
            Action::Reload => "reload",
        }
    }
}

/// Where in the action the event sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flank {
    Start,
    Done,
    Failed,
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub scope: Scope,
    pub action: Action,
    pub flank: Flank,
    /// Empty for project-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Set on container-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn project(action: Action, flank: Flank) -> Self {
        Event {
            scope: Scope::Project,
            action,
            flank,
            service: None,
            container: None,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn service(action: Action, flank: Flank, service: impl Into<String>) -> Self {
        Event {
            scope: Scope::Service,
            action,
            flank,
            service: Some(service.into()),
            container: None,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn container(
        action: Action,
        flank: Flank,
        service: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Event {
            scope: Scope::Container,
            action,
            flank,
            service: Some(service.into()),
            container: Some(container.into()),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.flank = Flank::Failed;
        self.error = Some(error.to_string());
        self
    }

    pub fn is(&self, scope: Scope, action: Action, flank: Flank) -> bool {
        self.scope == scope && self.action == action && self.flank == flank
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.flank {
            Flank::Start => "starting",
            Flank::Done => "done",
            Flank::Failed => "failed",
        };
        match (&self.service, &self.container) {
            (Some(service), Some(container)) => {
                write!(f, "{} {phase} [{service}/{container}]", self.action.as_str())
            }
            (Some(service), None) => write!(f, "{} {phase} [{service}]", self.action.as_str()),
            _ => write!(f, "{} {phase} [project]", self.action.as_str()),
        }
    }
}

/// Default bus capacity; a subscriber lagging further than this loses the
/// oldest events.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Bounded, non-blocking event fan-out.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; an event published with no
    /// subscribers is simply dropped.
    pub fn publish(&self, event: Event) {
        tracing::trace!(event = %event, "event");
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber receiving every subsequent event.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events dropped across all lagging subscribers since the bus
    /// was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Receive the next event. Lag is absorbed here: lost events are
    /// counted on the bus and reception continues with the oldest retained
    /// event. Returns `None` once the bus is gone and the backlog drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(lost = n, "slow event listener dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is immediately available.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
        out
    }
}

/// Spawn the default logging listener: every event goes to `tracing`, the
/// way a CLI front-end would narrate progress.
pub fn spawn_log_listener(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut stream = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            match event.flank {
                Flank::Failed => {
                    tracing::warn!(
                        action = event.action.as_str(),
                        service = event.service.as_deref().unwrap_or(""),
                        error = event.error.as_deref().unwrap_or(""),
                        data,
                        "{event}"
                    );
                }
                _ => {
                    tracing::info!(
                        action = event.action.as_str(),
                        service = event.service.as_deref().unwrap_or(""),
                        data,
                        "{event}"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();

        bus.publish(Event::service(Action::Up, Flank::Start, "web"));
        bus.publish(Event::service(Action::Up, Flank::Done, "web"));

        let first = stream.recv().await.unwrap();
        assert!(first.is(Scope::Service, Action::Up, Flank::Start));
        let second = stream.recv().await.unwrap();
        assert!(second.is(Scope::Service, Action::Up, Flank::Done));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(1);
        for _ in 0..100 {
            bus.publish(Event::project(Action::Up, Flank::Start));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();

        for i in 0..10 {
            bus.publish(Event::service(Action::Start, Flank::Start, format!("s{i}")));
        }

        // The first recv absorbs the lag, then delivery resumes from the
        // oldest retained event.
        let event = stream.recv().await.unwrap();
        assert!(bus.dropped() >= 6, "dropped = {}", bus.dropped());
        assert_eq!(event.service.as_deref(), Some("s6"));
    }

    #[tokio::test]
    async fn failed_event_carries_error() {
        let event = Event::service(Action::Create, Flank::Start, "db")
            .with_error("boom");
        assert_eq!(event.flank, Flank::Failed);
        assert_eq!(event.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn drain_collects_pending() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();
        bus.publish(Event::project(Action::Stop, Flank::Start));
        bus.publish(Event::project(Action::Stop, Flank::Done));
        let drained = stream.drain();
        assert_eq!(drained.len(), 2);
    }
}
