//! Start/Done/Failed event emission around an action.
//!
//! Every lifecycle verb produces the same triple of events per subject;
//! [`Phase`] wraps an arbitrary action with that emission so the verbs
//! carry no per-action boilerplate. The reload sentinel counts as a
//! completed action (the project engine handles the re-run), so it emits
//! `Done` plus a reload trigger rather than `Failed`.

use std::future::Future;

use crate::error::{Error, Result};
use crate::events::{Action, Event, EventBus, Flank, Scope};

pub struct Phase {
    bus: EventBus,
    scope: Scope,
    action: Action,
    service: Option<String>,
}

impl Phase {
    pub fn project(bus: &EventBus, action: Action) -> Self {
        Phase {
            bus: bus.clone(),
            scope: Scope::Project,
            action,
            service: None,
        }
    }

    pub fn service(bus: &EventBus, action: Action, service: impl Into<String>) -> Self {
        Phase {
            bus: bus.clone(),
            scope: Scope::Service,
            action,
            service: Some(service.into()),
        }
    }

    fn event(&self, flank: Flank) -> Event {
        match &self.service {
            Some(service) => Event::service(self.action, flank, service.clone()),
            None => Event::project(self.action, flank),
        }
    }

    /// Emit the start flank, run the action, emit done or failed.
    pub async fn run<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.bus.publish(self.event(Flank::Start));
        match action().await {
            Ok(value) => {
                self.bus.publish(self.event(Flank::Done));
                Ok(value)
            }
            Err(err) if err.is_restart() => {
                self.bus.publish(self.event(Flank::Done));
                if let Some(service) = &self.service {
                    self.bus
                        .publish(Event::service(Action::Reload, Flank::Start, service.clone()));
                }
                Err(err)
            }
            Err(err) => {
                self.bus.publish(self.event(Flank::Failed).with_error(&err));
                Err(err)
            }
        }
    }

    /// Emit the failure flanks for an action that never ran.
    pub fn skipped(&self, err: &Error) {
        self.bus.publish(self.event(Flank::Start));
        self.bus.publish(self.event(Flank::Failed).with_error(err));
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_emits_start_then_done() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();

        let phase = Phase::service(&bus, Action::Up, "web");
        phase.run(|| async { Ok(()) }).await.unwrap();

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert!(events[0].is(Scope::Service, Action::Up, Flank::Start));
        assert!(events[1].is(Scope::Service, Action::Up, Flank::Done));
    }

    #[tokio::test]
    async fn failure_emits_failed_with_error() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();

        let phase = Phase::service(&bus, Action::Stop, "db");
        let result: Result<()> = phase
            .run(|| async { Err(Error::ServiceNotFound("db".into())) })
            .await;
        assert!(result.is_err());

        let events = stream.drain();
        assert!(events[1].is(Scope::Service, Action::Stop, Flank::Failed));
        assert!(events[1].error.as_deref().unwrap().contains("db"));
    }

    #[tokio::test]
    async fn restart_sentinel_emits_done_and_reload() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();

        let phase = Phase::service(&bus, Action::Up, "web");
        let result: Result<()> = phase.run(|| async { Err(Error::RestartRequired) }).await;
        assert!(result.unwrap_err().is_restart());

        let events = stream.drain();
        assert!(events[1].is(Scope::Service, Action::Up, Flank::Done));
        assert!(events[2].is(Scope::Service, Action::Reload, Flank::Start));
    }
}
