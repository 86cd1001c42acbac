use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::mpsc;

use super::kubernetes::{handle_event, snapshot_of, to_raw_secret, PodReconciler};
use super::SourceKind;
use crate::keychain::{SECRET_TYPE_DOCKERCFG, SECRET_TYPE_DOCKER_CONFIG_JSON};
use crate::models::ObservationAction;
use crate::reconcile::{Reconciler, Requeue, WorkQueue};

fn pod(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|(container_name, image)| Container {
                    name: container_name.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A client that points nowhere; tests that use it never touch the API.
fn offline_client() -> Client {
    let uri = http::Uri::try_from("http://127.0.0.1:8080").unwrap();
    Client::try_from(kube::Config::new(uri)).unwrap()
}

#[test]
fn test_source_kind_parsing() {
    assert_eq!("kubernetes".parse(), Ok(SourceKind::Kubernetes));
    assert_eq!("docker".parse(), Ok(SourceKind::Docker));
    assert!("podman".parse::<SourceKind>().is_err());
}

#[test]
fn test_snapshot_of_extracts_containers_and_metadata() {
    let (key, snapshot) =
        snapshot_of(&pod("default", "web", &[("app", "nginx:1.25"), ("sidecar", "envoy:v1.28")]))
            .unwrap();

    assert_eq!(key, "default/web");
    assert_eq!(snapshot.namespace, "default");
    assert_eq!(snapshot.name, "web");
    assert_eq!(snapshot.labels.get("app").map(String::as_str), Some("web"));
    assert_eq!(snapshot.containers.len(), 2);
    assert_eq!(snapshot.containers[0].name, "app");
    assert_eq!(snapshot.containers[0].image, "nginx:1.25");
}

#[test]
fn test_snapshot_of_ignores_incomplete_pods() {
    let mut incomplete = pod("default", "web", &[("app", "nginx:1.25")]);
    incomplete.metadata.namespace = None;
    assert!(snapshot_of(&incomplete).is_none());

    let mut specless = pod("default", "web", &[]);
    specless.spec = None;
    assert!(snapshot_of(&specless).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_applied_event_caches_and_enqueues() {
    let pods = DashMap::new();
    let queue = WorkQueue::new();

    handle_event(
        watcher::Event::Applied(pod("default", "web", &[("app", "nginx:1.25")])),
        &pods,
        &queue,
    );

    assert!(pods.contains_key("default/web"));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.next().await, Some("default/web".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_event_drops_cache_and_enqueues_immediately() {
    let pods = DashMap::new();
    let queue = WorkQueue::new();
    let web = pod("default", "web", &[("app", "nginx:1.25")]);

    handle_event(watcher::Event::Applied(web.clone()), &pods, &queue);
    assert_eq!(queue.next().await, Some("default/web".to_string()));

    handle_event(watcher::Event::Deleted(web), &pods, &queue);
    assert!(!pods.contains_key("default/web"));
    assert_eq!(queue.next().await, Some("default/web".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_restart_prunes_pods_that_vanished() {
    let pods = DashMap::new();
    let queue = WorkQueue::new();

    handle_event(
        watcher::Event::Applied(pod("default", "gone", &[("app", "nginx:1.25")])),
        &pods,
        &queue,
    );
    assert_eq!(queue.next().await, Some("default/gone".to_string()));

    handle_event(
        watcher::Event::Restarted(vec![
            pod("default", "kept", &[("app", "nginx:1.25")]),
            pod("kube-system", "fresh", &[("app", "coredns:1.11")]),
        ]),
        &pods,
        &queue,
    );

    assert!(!pods.contains_key("default/gone"));
    assert!(pods.contains_key("default/kept"));
    assert!(pods.contains_key("kube-system/fresh"));

    let mut keys = Vec::new();
    for _ in 0..3 {
        keys.push(queue.next().await.unwrap());
    }
    keys.sort();
    assert_eq!(keys, vec!["default/gone", "default/kept", "kube-system/fresh"]);
}

#[test]
fn test_to_raw_secret_extracts_payload_by_shape() {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("regcred".to_string()),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_DOCKER_CONFIG_JSON.to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(br#"{"auths": {}}"#.to_vec()),
        )])),
        ..Default::default()
    };
    let raw = to_raw_secret(secret);
    assert_eq!(raw.name, "regcred");
    assert_eq!(raw.secret_type, SECRET_TYPE_DOCKER_CONFIG_JSON);
    assert_eq!(raw.payload, br#"{"auths": {}}"#.to_vec());

    let legacy = Secret {
        metadata: ObjectMeta {
            name: Some("old-regcred".to_string()),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_DOCKERCFG.to_string()),
        data: Some(BTreeMap::from([(
            ".dockercfg".to_string(),
            ByteString(b"{}".to_vec()),
        )])),
        ..Default::default()
    };
    assert_eq!(to_raw_secret(legacy).payload, b"{}".to_vec());

    let empty = Secret {
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    assert!(to_raw_secret(empty).payload.is_empty());
}

#[tokio::test]
async fn test_reconcile_emits_removals_for_deleted_pod() {
    let (tx, mut rx) = mpsc::channel(8);
    let reconciler = PodReconciler {
        client: offline_client(),
        pods: Arc::new(DashMap::new()),
        attributed: Arc::new(DashMap::new()),
        check_interval: Duration::from_secs(3600),
        tx,
    };
    reconciler.attributed.insert(
        "default/web".to_string(),
        vec!["app".to_string(), "sidecar".to_string()],
    );

    let verdict = reconciler.reconcile(&"default/web".to_string()).await.unwrap();
    assert_eq!(verdict, Requeue::Forget);

    let mut identities = vec![
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ];
    identities.sort_by(|a, b| a.identity.cmp(&b.identity));
    assert!(identities
        .iter()
        .all(|observation| observation.action == ObservationAction::Removed));
    assert_eq!(identities[0].identity, "default/web/app");
    assert_eq!(identities[1].identity, "default/web/sidecar");

    // The side cache is cleared: a second pass emits nothing.
    let verdict = reconciler.reconcile(&"default/web".to_string()).await.unwrap();
    assert_eq!(verdict, Requeue::Forget);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reconcile_emits_added_per_container() {
    let (tx, mut rx) = mpsc::channel(8);
    let pods = Arc::new(DashMap::new());
    let (key, snapshot) =
        snapshot_of(&pod("default", "web", &[("app", "nginx:1.25"), ("sidecar", "envoy:v1.28")]))
            .unwrap();
    pods.insert(key.clone(), snapshot);

    let check_interval = Duration::from_secs(3600);
    let reconciler = PodReconciler {
        client: offline_client(),
        pods,
        attributed: Arc::new(DashMap::new()),
        check_interval,
        tx,
    };

    let verdict = reconciler.reconcile(&key).await.unwrap();
    match verdict {
        Requeue::After(delay) => {
            assert!(delay >= check_interval);
            assert!(delay <= check_interval + check_interval / 2);
        }
        other => panic!("expected periodic requeue, got {other:?}"),
    }

    let first = rx.recv().await.unwrap();
    assert_eq!(first.action, ObservationAction::Added);
    assert_eq!(first.identity, "default/web/app");
    assert_eq!(first.image.as_deref(), Some("nginx:1.25"));
    assert!(first.credentials.is_some());
    assert_eq!(first.labels.get("app").map(String::as_str), Some("web"));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.identity, "default/web/sidecar");

    let attributed = reconciler.attributed.get(&key).unwrap();
    assert_eq!(*attributed.value(), vec!["app".to_string(), "sidecar".to_string()]);
}
