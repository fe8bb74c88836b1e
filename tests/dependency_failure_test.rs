//! Failure propagation: dependency failures, error aggregation,
//! independent services continuing, cancellation.

use std::sync::Arc;

use convoy::engine::{EngineError, InMemoryEngine};
use convoy::error::Error;
use convoy::events::{Action, Flank, Scope};
use convoy::project::options::UpOptions;
use convoy::project::Project;

fn project_with(engine: Arc<InMemoryEngine>, yaml: &str) -> Project {
    Project::from_buffers("demo", &[("docker-compose.yml", yaml)], engine, &[]).unwrap()
}

#[tokio::test]
async fn dependent_is_skipped_when_dependency_fails() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    engine.fail_always(
        "create",
        "demo_base",
        EngineError::Other("disk full".into()),
    );

    let project = project_with(
        Arc::clone(&engine),
        r#"
base:
  image: busybox
app:
  image: busybox
  depends_on: [base]
lone:
  image: busybox
"#,
    );

    let mut stream = project.bus().subscribe();
    let err = project.up(UpOptions::default(), &[]).await.unwrap_err();

    // Both the failing service and its dependent are reported.
    match err {
        Error::Aggregate(errors) => {
            assert_eq!(errors.len(), 2);
            let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            assert!(
                rendered.iter().any(|e| e.contains("disk full")),
                "{rendered:?}"
            );
            assert!(
                rendered
                    .iter()
                    .any(|e| e.contains("dependency 'base' of service 'app' failed")),
                "{rendered:?}"
            );
        }
        other => panic!("expected aggregate, got {other}"),
    }

    // The independent service still came up.
    let names = engine.container_names();
    assert!(names.contains(&"demo_lone_1".to_string()));
    assert!(!names.iter().any(|n| n.starts_with("demo_app")));

    // Events: a Failed triple for both base and app.
    let events = stream.drain();
    let failed: Vec<&str> = events
        .iter()
        .filter(|e| e.scope == Scope::Service && e.action == Action::Up && e.flank == Flank::Failed)
        .filter_map(|e| e.service.as_deref())
        .collect();
    assert!(failed.contains(&"base"));
    assert!(failed.contains(&"app"));
}

#[tokio::test]
async fn single_failure_is_returned_unwrapped() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    engine.fail_always("start", "demo_web", EngineError::Other("boom".into()));

    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");
    let err = project.up(UpOptions::default(), &[]).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)), "got {err}");
}

#[tokio::test]
async fn transient_engine_errors_are_retried() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.fail_once(
        "pull",
        "busybox",
        EngineError::Transport("connection reset".into()),
    );

    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");
    // The single transient failure is absorbed by the retry.
    project.up(UpOptions::default(), &[]).await.unwrap();
    assert_eq!(engine.container_names(), vec!["demo_web_1"]);
}

#[tokio::test]
async fn missing_image_surfaces_as_image_unavailable() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.fail_always("pull", "busybox", EngineError::ImageNotFound("busybox".into()));

    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");
    let err = project.up(UpOptions::default(), &[]).await.unwrap_err();
    match err {
        Error::ImageUnavailable { service, .. } => assert_eq!(service, "web"),
        other => panic!("expected ImageUnavailable, got {other}"),
    }
}

#[tokio::test]
async fn cancelled_project_reports_cancellation() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");
    project.cancel_operations();

    let err = project.up(UpOptions::default(), &[]).await.unwrap_err();
    assert!(
        matches!(err, Error::Engine(EngineError::Cancelled)),
        "got {err}"
    );
    assert!(engine.container_names().is_empty());
}

#[tokio::test]
async fn failure_in_one_replica_reports_service_failure() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");
    project.up(UpOptions::default(), &[]).await.unwrap();
    project
        .scale(&std::collections::BTreeMap::from([("web".to_string(), 3)]), None)
        .await
        .unwrap();

    // One replica refuses to stop; the other two still get stopped.
    engine.fail_always("stop", "demo_web_2", EngineError::Other("wedged".into()));
    let err = project.stop(None, &[]).await.unwrap_err();
    assert!(err.to_string().contains("wedged"), "{err}");

    let (_, handles) = project.containers(&["web"]).await.unwrap().remove(0);
    let still_running: Vec<&str> = handles
        .iter()
        .filter(|h| h.is_running())
        .map(|h| h.name())
        .collect();
    assert_eq!(still_running, vec!["demo_web_2"]);
}
