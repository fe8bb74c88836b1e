//! Per-service execution wrappers for project-wide actions.
//!
//! Each target service gets one [`ServiceExecutor`] and one spawned task.
//! A task first awaits the completion signals of the executors it depends
//! on, then runs its action under the project's parallelism limit, then
//! publishes its own completion through a `watch` channel. Dependency
//! failures short-circuit: the action never runs and the service records
//! `DependencyFailed`. The reload sentinel propagates the same way so
//! whole dependency chains re-enter together.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;

/// Terminal result of one service's action.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done,
    /// The action (or a dependency's) requested a project reload.
    Restart,
    Failed(Arc<Error>),
}

impl Outcome {
    pub fn is_restart(&self) -> bool {
        matches!(self, Outcome::Restart)
    }
}

/// Execution state broadcast to dependents.
#[derive(Debug, Clone)]
pub enum ExecState {
    Pending,
    Running,
    Finished(Outcome),
}

/// One service's completion signal for a single action round.
pub struct ServiceExecutor {
    name: String,
    tx: watch::Sender<ExecState>,
}

impl ServiceExecutor {
    pub fn new(name: &str) -> Self {
        let (tx, _) = watch::channel(ExecState::Pending);
        ServiceExecutor {
            name: name.to_string(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watch(&self) -> watch::Receiver<ExecState> {
        self.tx.subscribe()
    }

    pub fn mark_running(&self) {
        self.tx.send_replace(ExecState::Running);
    }

    pub fn finish(&self, outcome: Outcome) {
        self.tx.send_replace(ExecState::Finished(outcome));
    }

    /// Mark a service already satisfied, so dependents in a later reload
    /// round do not wait on it again.
    pub fn reset_done(&self) {
        self.tx.send_replace(ExecState::Finished(Outcome::Done));
    }

    /// Rearm for a reload round.
    pub fn reset_pending(&self) {
        self.tx.send_replace(ExecState::Pending);
    }
}

/// Await the terminal state of a dependency's executor.
pub async fn wait_for_outcome(rx: &mut watch::Receiver<ExecState>) -> Outcome {
    let result = rx
        .wait_for(|state| matches!(state, ExecState::Finished(_)))
        .await;
    match result {
        Ok(state) => match &*state {
            ExecState::Finished(outcome) => outcome.clone(),
            _ => unreachable!("wait_for yielded a non-terminal state"),
        },
        // Sender dropped without finishing; treat as failure.
        Err(_) => Outcome::Failed(Arc::new(Error::Cancelled("dependency task".into()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dependents_observe_completion() {
        let executor = ServiceExecutor::new("db");
        let mut rx = executor.watch();

        let waiter = tokio::spawn(async move { wait_for_outcome(&mut rx).await });

        executor.mark_running();
        executor.finish(Outcome::Done);

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Outcome::Done));
    }

    #[tokio::test]
    async fn failure_is_visible_to_late_subscribers() {
        let executor = ServiceExecutor::new("db");
        executor.finish(Outcome::Failed(Arc::new(Error::ServiceNotFound(
            "db".into(),
        ))));

        let mut rx = executor.watch();
        let outcome = wait_for_outcome(&mut rx).await;
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn dropped_executor_reads_as_failure() {
        let executor = ServiceExecutor::new("db");
        let mut rx = executor.watch();
        drop(executor);

        let outcome = wait_for_outcome(&mut rx).await;
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn reset_pending_rearms() {
        let executor = ServiceExecutor::new("db");
        executor.finish(Outcome::Restart);
        executor.reset_pending();

        let mut rx = executor.watch();
        assert!(matches!(&*rx.borrow(), ExecState::Pending));

        executor.finish(Outcome::Done);
        let outcome = wait_for_outcome(&mut rx).await;
        assert!(matches!(outcome, Outcome::Done));
    }
}
