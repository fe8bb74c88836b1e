//! Scaling arithmetic, ordinal uniqueness, and one-off runs.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use convoy::engine::InMemoryEngine;
use convoy::error::Error;
use convoy::project::options::{RunOptions, UpOptions};
use convoy::project::Project;
use convoy::runtime::labels;
use convoy::runtime::service::ContainerSelection;

fn project_with(engine: Arc<InMemoryEngine>, yaml: &str) -> Project {
    Project::from_buffers("demo", &[("docker-compose.yml", yaml)], engine, &[]).unwrap()
}

fn scale_map(service: &str, count: usize) -> BTreeMap<String, usize> {
    BTreeMap::from([(service.to_string(), count)])
}

#[tokio::test]
async fn scale_up_creates_exact_replica_count() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");

    project.up(UpOptions::default(), &[]).await.unwrap();
    project.scale(&scale_map("web", 3), None).await.unwrap();

    let (_, handles) = project.containers(&["web"]).await.unwrap().remove(0);
    let running: Vec<_> = handles.iter().filter(|h| h.is_running()).collect();
    assert_eq!(running.len(), 3);

    // Ordinal uniqueness at quiescence.
    let numbers: HashSet<u32> = running.iter().filter_map(|h| h.number()).collect();
    assert_eq!(numbers, HashSet::from([1, 2, 3]));
}

#[tokio::test]
async fn scale_down_sheds_highest_ordinals_first() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");

    project.up(UpOptions::default(), &[]).await.unwrap();
    project.scale(&scale_map("web", 3), None).await.unwrap();
    project.scale(&scale_map("web", 1), None).await.unwrap();

    assert_eq!(engine.container_names(), vec!["demo_web_1"]);

    let removals: Vec<String> = engine
        .operations()
        .into_iter()
        .filter(|(op, _)| op == "remove")
        .map(|(_, target)| target)
        .collect();
    assert_eq!(removals, vec!["demo_web_3", "demo_web_2"]);
}

#[tokio::test]
async fn scale_reuses_freed_ordinals() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");

    project.scale(&scale_map("web", 3), None).await.unwrap();
    project.scale(&scale_map("web", 1), None).await.unwrap();
    project.scale(&scale_map("web", 2), None).await.unwrap();

    let mut names = engine.container_names();
    names.sort();
    assert_eq!(names, vec!["demo_web_1", "demo_web_2"]);
}

#[tokio::test]
async fn pinned_container_name_rejects_scaling() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(
        Arc::clone(&engine),
        "db:\n  image: busybox\n  container_name: my-db\n",
    );

    project.up(UpOptions::default(), &[]).await.unwrap();
    assert_eq!(engine.container_names(), vec!["my-db"]);

    let err = project.scale(&scale_map("db", 2), None).await.unwrap_err();
    match err {
        Error::ConflictingState(msg) => assert!(msg.contains("my-db"), "{msg}"),
        other => panic!("expected ConflictingState, got {other}"),
    }
}

#[tokio::test]
async fn one_off_run_returns_exit_code_and_labels() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");

    // Long-running replicas exist alongside the one-off.
    project.up(UpOptions::default(), &[]).await.unwrap();

    let code = project
        .run(
            "web",
            vec!["/bin/sh".into(), "-c".into(), "exit 7".into()],
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(code, 7);

    let runtime = project.runtime("web").unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();

    let one_offs = runtime
        .containers(&cancel, ContainerSelection::OneOff)
        .await
        .unwrap();
    assert_eq!(one_offs.len(), 1);
    assert_eq!(one_offs[0].name(), "demo_web_run_1");
    assert!(one_offs[0].is_one_off());
    assert_eq!(one_offs[0].details().label(labels::ONEOFF), Some("True"));

    // The one-off does not clash with replica ordinals.
    let replicas = runtime
        .containers(&cancel, ContainerSelection::Replicas)
        .await
        .unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].name(), "demo_web_1");
}

#[tokio::test]
async fn detached_run_returns_zero_immediately() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = project_with(Arc::clone(&engine), "web:\n  image: busybox\n");

    let code = project
        .run(
            "web",
            vec!["sleep".into(), "600".into()],
            RunOptions { detached: true },
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    // Container was started and left running.
    let (_, handles) = project.containers(&["web"]).await.unwrap().remove(0);
    assert!(handles.iter().any(|h| h.is_one_off() && h.is_running()));
}

#[tokio::test]
async fn concurrent_one_offs_get_distinct_ordinals() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    let project = Arc::new(project_with(Arc::clone(&engine), "web:\n  image: busybox\n"));

    let mut joins = Vec::new();
    for _ in 0..4 {
        let project = Arc::clone(&project);
        joins.push(tokio::spawn(async move {
            project
                .run(
                    "web",
                    vec!["/bin/sh".into(), "-c".into(), "exit 0".into()],
                    RunOptions::default(),
                )
                .await
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }

    let names: HashSet<String> = engine.container_names().into_iter().collect();
    assert_eq!(
        names,
        HashSet::from([
            "demo_web_run_1".to_string(),
            "demo_web_run_2".to_string(),
            "demo_web_run_3".to_string(),
            "demo_web_run_4".to_string(),
        ])
    );
}
