//! Dependency ordering across project bring-up and teardown.

use std::sync::Arc;

use convoy::engine::InMemoryEngine;
use convoy::events::{Action, Event, Flank, Scope};
use convoy::project::options::UpOptions;
use convoy::project::Project;

fn project_with(engine: Arc<InMemoryEngine>, yaml: &str) -> Project {
    Project::from_buffers("demo", &[("docker-compose.yml", yaml)], engine, &[]).unwrap()
}

fn service_events(events: &[Event], action: Action) -> Vec<(String, Flank)> {
    events
        .iter()
        .filter(|e| e.scope == Scope::Service && e.action == action)
        .map(|e| (e.service.clone().unwrap(), e.flank))
        .collect()
}

fn position(events: &[(String, Flank)], service: &str, flank: Flank) -> usize {
    events
        .iter()
        .position(|(s, f)| s == service && *f == flank)
        .unwrap_or_else(|| panic!("no {flank:?} event for {service}"))
}

#[tokio::test]
async fn up_starts_dependencies_before_dependents() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(
        Arc::clone(&engine),
        r#"
db:
  image: busybox
cache:
  image: busybox
web:
  image: busybox
  links: [db]
  depends_on: [cache]
"#,
    );

    let mut stream = project.bus().subscribe();
    project.up(UpOptions::default(), &[]).await.unwrap();

    let events = stream.drain();
    let ups = service_events(&events, Action::Up);

    // Both prerequisites complete before web even begins.
    let web_start = position(&ups, "web", Flank::Start);
    assert!(position(&ups, "db", Flank::Done) < web_start);
    assert!(position(&ups, "cache", Flank::Done) < web_start);

    let mut names = engine.container_names();
    names.sort();
    assert_eq!(names, vec!["demo_cache_1", "demo_db_1", "demo_web_1"]);
}

#[tokio::test]
async fn stop_reverses_the_order() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(
        Arc::clone(&engine),
        r#"
a:
  image: busybox
b:
  image: busybox
  links: [a]
"#,
    );
    project.up(UpOptions::default(), &[]).await.unwrap();

    let mut stream = project.bus().subscribe();
    project.stop(None, &[]).await.unwrap();

    let events = stream.drain();
    let stops = service_events(&events, Action::Stop);

    // b stops strictly before a begins stopping, and a finishes last.
    assert!(position(&stops, "b", Flank::Start) < position(&stops, "a", Flank::Start));
    assert!(position(&stops, "b", Flank::Done) < position(&stops, "a", Flank::Done));
}

#[tokio::test]
async fn down_removes_dependents_first() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(
        Arc::clone(&engine),
        r#"
a:
  image: busybox
b:
  image: busybox
  depends_on: [a]
"#,
    );
    project.up(UpOptions::default(), &[]).await.unwrap();
    project
        .down(convoy::project::options::DownOptions::default(), &[])
        .await
        .unwrap();

    assert!(engine.container_names().is_empty());

    // Removal order: b's container goes before a's.
    let removals: Vec<String> = engine
        .operations()
        .into_iter()
        .filter(|(op, _)| op == "remove")
        .map(|(_, target)| target)
        .collect();
    assert_eq!(removals, vec!["demo_b_1", "demo_a_1"]);
}

#[tokio::test]
async fn stopping_one_service_stops_its_dependents_too() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = project_with(
        Arc::clone(&engine),
        r#"
a:
  image: busybox
b:
  image: busybox
  depends_on: [a]
c:
  image: busybox
"#,
    );
    project.up(UpOptions::default(), &[]).await.unwrap();

    // Filtering on `a` pulls in dependent `b`; unrelated `c` keeps running.
    project.stop(None, &["a"]).await.unwrap();

    let containers = project.containers(&[]).await.unwrap();
    for (service, handles) in containers {
        let running = handles.iter().any(|h| h.is_running());
        match service.as_str() {
            "c" => assert!(running, "c should still be running"),
            _ => assert!(!running, "{service} should be stopped"),
        }
    }
}
