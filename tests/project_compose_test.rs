//! Composing projects from manifests: interpolation, overlays, extends,
//! cycle rejection.

use std::sync::Arc;

use convoy::engine::InMemoryEngine;
use convoy::error::Error;
use convoy::project::options::UpOptions;
use convoy::project::Project;

#[tokio::test]
async fn interpolation_defaults_flow_into_containers() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");
    engine.seed_image("nginx");

    let yaml = "web:\n  image: \"${IMG:-busybox}\"\n";

    let defaulted =
        Project::from_buffers(
            "a",
            &[("docker-compose.yml", yaml)],
            Arc::clone(&engine) as Arc<dyn convoy::engine::EngineClient>,
            &[],
        )
        .unwrap();
    assert_eq!(
        defaulted.manifest().service("web").unwrap().image.as_deref(),
        Some("busybox")
    );

    let overridden = Project::from_buffers(
        "b",
        &[("docker-compose.yml", yaml)],
        Arc::clone(&engine) as Arc<dyn convoy::engine::EngineClient>,
        &[("IMG", "nginx")],
    )
    .unwrap();
    assert_eq!(
        overridden.manifest().service("web").unwrap().image.as_deref(),
        Some("nginx")
    );

    overridden.up(UpOptions::default(), &[]).await.unwrap();
    let (_, handles) = overridden.containers(&["web"]).await.unwrap().remove(0);
    assert_eq!(handles[0].details().image, "nginx");
}

#[test]
fn overlay_scalars_take_last_file_lists_concatenate() {
    let engine = Arc::new(InMemoryEngine::new());
    let project = Project::from_buffers(
        "demo",
        &[
            (
                "docker-compose.yml",
                "web:\n  image: A\n  ports: [\"80\"]\n",
            ),
            (
                "docker-compose.override.yml",
                "web:\n  image: B\n  ports: [\"443\"]\n",
            ),
        ],
        engine,
        &[],
    )
    .unwrap();

    let web = project.manifest().service("web").unwrap();
    assert_eq!(web.image.as_deref(), Some("B"));
    assert_eq!(web.ports, vec!["80", "443"]);
}

#[test]
fn overlay_deduplicates_repeated_ports() {
    let engine = Arc::new(InMemoryEngine::new());
    let project = Project::from_buffers(
        "demo",
        &[
            ("base.yml", "web:\n  image: A\n  ports: [\"80\", \"443\"]\n"),
            ("override.yml", "web:\n  image: A\n  ports: [\"443\"]\n"),
        ],
        engine,
        &[],
    )
    .unwrap();

    assert_eq!(
        project.manifest().service("web").unwrap().ports,
        vec!["80", "443"]
    );
}

#[tokio::test]
async fn dependency_cycle_is_fatal_and_touches_nothing() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let result = Project::from_buffers(
        "demo",
        &[(
            "docker-compose.yml",
            "a:\n  image: busybox\n  depends_on: [b]\nb:\n  image: busybox\n  depends_on: [a]\n",
        )],
        Arc::clone(&engine) as Arc<dyn convoy::engine::EngineClient>,
        &[],
    );

    match result {
        Err(Error::InvalidManifest(msg)) => {
            assert!(msg.contains("cycle"), "{msg}");
            assert!(msg.contains("a") && msg.contains("b"), "{msg}");
        }
        Err(other) => panic!("expected InvalidManifest, got {other}"),
        Ok(_) => panic!("cycle must be rejected"),
    }

    // Fatal configuration errors happen before any engine mutation.
    assert!(engine.operations().is_empty());
    assert!(engine.container_names().is_empty());
}

#[test]
fn extends_cycle_is_fatal() {
    let engine = Arc::new(InMemoryEngine::new());
    let result = Project::from_buffers(
        "demo",
        &[(
            "docker-compose.yml",
            "a:\n  extends:\n    service: b\nb:\n  extends:\n    service: a\n",
        )],
        engine,
        &[],
    );
    match result {
        Err(Error::InvalidManifest(msg)) => assert!(msg.contains("extends"), "{msg}"),
        Err(other) => panic!("expected InvalidManifest, got {other}"),
        Ok(_) => panic!("expected InvalidManifest, got Ok"),
    }
}

#[test]
fn unknown_service_in_filter_is_reported() {
    let engine = Arc::new(InMemoryEngine::new());
    let project = Project::from_buffers(
        "demo",
        &[("docker-compose.yml", "web:\n  image: busybox\n")],
        engine,
        &[],
    )
    .unwrap();

    let err = match project.runtime("ghost") {
        Err(e) => e,
        Ok(_) => panic!("expected ServiceNotFound"),
    };
    assert!(matches!(err, Error::ServiceNotFound(name) if name == "ghost"));
}

#[tokio::test]
async fn declared_networks_are_created_and_joined() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("busybox");

    let project = Project::from_buffers(
        "demo",
        &[(
            "docker-compose.yml",
            r#"
version: "2"
services:
  web:
    image: busybox
    networks:
      front:
        aliases: [www]
networks:
  front:
    driver: bridge
  outside:
    external: true
"#,
        )],
        Arc::clone(&engine) as Arc<dyn convoy::engine::EngineClient>,
        &[],
    )
    .unwrap();

    project.up(UpOptions::default(), &[]).await.unwrap();

    let ops = engine.operations();
    assert!(ops.contains(&("network_create".to_string(), "front".to_string())));
    // External networks are never created by the project.
    assert!(!ops.contains(&("network_create".to_string(), "outside".to_string())));
    assert!(ops.contains(&(
        "network_connect".to_string(),
        "front:demo_web_1".to_string()
    )));
}

#[tokio::test]
async fn published_port_is_resolvable() {
    let engine = Arc::new(InMemoryEngine::new());
    engine.seed_image("nginx");

    let project = Project::from_buffers(
        "demo",
        &[(
            "docker-compose.yml",
            "web:\n  image: nginx\n  ports: [\"127.0.0.1:8080:80\"]\n",
        )],
        engine,
        &[],
    )
    .unwrap();
    project.up(UpOptions::default(), &[]).await.unwrap();

    let addr = project.port("web", 1, "tcp", 80).await.unwrap();
    assert_eq!(addr.as_deref(), Some("127.0.0.1:8080"));

    // An unpublished port resolves to nothing.
    let missing = project.port("web", 1, "tcp", 443).await.unwrap();
    assert!(missing.is_none());
}

#[test]
fn version_mismatch_across_files_is_rejected() {
    let engine = Arc::new(InMemoryEngine::new());
    let result = Project::from_buffers(
        "demo",
        &[
            (
                "base.yml",
                "version: \"2\"\nservices:\n  web:\n    image: a\n",
            ),
            ("override.yml", "web:\n  image: b\n"),
        ],
        engine,
        &[],
    );
    assert!(matches!(result, Err(Error::InvalidManifest(_))));
}
