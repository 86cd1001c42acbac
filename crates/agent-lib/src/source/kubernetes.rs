//! Cluster reconciler source
//!
//! Watches the pod fleet through the API server, mirrors it into a local
//! informer-style cache feeding a retrying work queue, resolves
//! per-workload pull credentials, and emits one observation per
//! container. Everything is level-triggered: watch events, periodic
//! resyncs, and per-pod rechecks all just enqueue the pod key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::runtime::watcher;
use kube::{Api, Client};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::keychain::{Keychain, RawSecret};
use crate::models::{Observation, ObservationAction};
use crate::reconcile::{ReconcileLoop, Reconciler, Requeue, WorkQueue};
use crate::source::{ContainerSource, OBSERVATION_BUFFER};

/// Spread of the randomized delay applied to newly observed pods, so a
/// fresh watch cache does not stampede the registries.
pub const STARTUP_JITTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Use the in-cluster connection configuration instead of kubeconfig
    pub in_cluster: bool,
    /// How often the watch cache re-enqueues every known pod
    pub resync_interval: Duration,
    /// How often each pod's images are re-evaluated
    pub check_interval: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            in_cluster: true,
            resync_interval: Duration::from_secs(300),
            check_interval: Duration::from_secs(3600),
        }
    }
}

/// What the reconciler needs to know about a pod, captured at watch time
#[derive(Debug, Clone)]
pub(crate) struct PodSnapshot {
    pub(crate) namespace: String,
    pub(crate) name: String,
    pub(crate) labels: HashMap<String, String>,
    pub(crate) annotations: HashMap<String, String>,
    pub(crate) service_account: Option<String>,
    pub(crate) pull_secrets: Vec<String>,
    pub(crate) containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone)]
pub(crate) struct ContainerSpec {
    pub(crate) name: String,
    pub(crate) image: String,
}

pub struct KubernetesSource {
    client: Client,
    config: KubernetesConfig,
    pods: Arc<DashMap<String, PodSnapshot>>,
    attributed: Arc<DashMap<String, Vec<String>>>,
    queue: Arc<WorkQueue<String>>,
}

impl KubernetesSource {
    /// Connect to the cluster and probe the API server. A failed
    /// connection aborts startup.
    pub async fn connect(config: KubernetesConfig) -> anyhow::Result<Self> {
        let kube_config = if config.in_cluster {
            kube::Config::incluster().context("in-cluster configuration unavailable")?
        } else {
            kube::Config::infer()
                .await
                .context("could not infer cluster configuration")?
        };
        let client = Client::try_from(kube_config)?;
        let version = client
            .apiserver_version()
            .await
            .context("failed to reach the API server")?;
        info!(version = %version.git_version, "connected to cluster");

        Ok(Self {
            client,
            config,
            pods: Arc::new(DashMap::new()),
            attributed: Arc::new(DashMap::new()),
            queue: Arc::new(WorkQueue::new()),
        })
    }
}

#[async_trait]
impl ContainerSource for KubernetesSource {
    async fn observe(
        &self,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<mpsc::Receiver<Observation>> {
        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);

        let watch = WatchTask {
            api: Api::all(self.client.clone()),
            resync_interval: self.config.resync_interval,
            pods: self.pods.clone(),
            queue: self.queue.clone(),
        };
        tokio::spawn(watch.run(shutdown.resubscribe()));

        let reconciler = PodReconciler {
            client: self.client.clone(),
            pods: self.pods.clone(),
            attributed: self.attributed.clone(),
            check_interval: self.config.check_interval,
            tx,
        };
        tokio::spawn(ReconcileLoop::new(self.queue.clone(), reconciler).run(shutdown));

        Ok(rx)
    }
}

/// Drains the pod watch into the local cache and the work queue
struct WatchTask {
    api: Api<Pod>,
    resync_interval: Duration,
    pods: Arc<DashMap<String, PodSnapshot>>,
    queue: Arc<WorkQueue<String>>,
}

impl WatchTask {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut stream = watcher(self.api.clone(), watcher::Config::default()).boxed();
        let start = tokio::time::Instant::now() + self.resync_interval;
        let mut resync = tokio::time::interval_at(start, self.resync_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = resync.tick() => {
                    debug!(pods = self.pods.len(), "resync, re-enqueueing all known pods");
                    for entry in self.pods.iter() {
                        self.queue.add_after(entry.key().clone(), random_delay(STARTUP_JITTER));
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => handle_event(event, &self.pods, &self.queue),
                    Some(Err(error)) => warn!(error = %error, "pod watch error, stream will retry"),
                    None => break,
                },
            }
        }
    }
}

/// Apply one watch event to the cache and schedule the affected keys.
pub(crate) fn handle_event(
    event: watcher::Event<Pod>,
    pods: &DashMap<String, PodSnapshot>,
    queue: &WorkQueue<String>,
) {
    match event {
        watcher::Event::Applied(pod) => {
            if let Some((key, snapshot)) = snapshot_of(&pod) {
                pods.insert(key.clone(), snapshot);
                queue.add_after(key, random_delay(STARTUP_JITTER));
            }
        }
        watcher::Event::Deleted(pod) => {
            // Key off metadata alone; the final object of a deleted pod
            // is not guaranteed to carry a full spec.
            if let (Some(namespace), Some(name)) = (&pod.metadata.namespace, &pod.metadata.name) {
                let key = format!("{namespace}/{name}");
                pods.remove(&key);
                queue.add(key);
            }
        }
        watcher::Event::Restarted(list) => {
            let mut seen = std::collections::HashSet::new();
            for pod in &list {
                if let Some((key, snapshot)) = snapshot_of(pod) {
                    seen.insert(key.clone());
                    pods.insert(key.clone(), snapshot);
                    queue.add_after(key, random_delay(STARTUP_JITTER));
                }
            }
            // Pods that vanished while the watch was down still owe their
            // removal observations.
            let stale: Vec<String> = pods
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|key| !seen.contains(key))
                .collect();
            for key in stale {
                pods.remove(&key);
                queue.add(key);
            }
        }
    }
}

/// Extract the reconciler's view of a pod. Pods without namespace, name,
/// or spec are ignored.
pub(crate) fn snapshot_of(pod: &Pod) -> Option<(String, PodSnapshot)> {
    let namespace = pod.metadata.namespace.clone()?;
    let name = pod.metadata.name.clone()?;
    let spec = pod.spec.as_ref()?;
    let key = format!("{namespace}/{name}");

    let containers = spec
        .containers
        .iter()
        .filter_map(|container| {
            container.image.as_ref().map(|image| ContainerSpec {
                name: container.name.clone(),
                image: image.clone(),
            })
        })
        .collect();

    let snapshot = PodSnapshot {
        namespace,
        name,
        labels: pod
            .metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        annotations: pod
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_account: spec.service_account_name.clone(),
        pull_secrets: spec
            .image_pull_secrets
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|reference| reference.name)
            .collect(),
        containers,
    };
    Some((key, snapshot))
}

pub(crate) struct PodReconciler {
    pub(crate) client: Client,
    pub(crate) pods: Arc<DashMap<String, PodSnapshot>>,
    pub(crate) attributed: Arc<DashMap<String, Vec<String>>>,
    pub(crate) check_interval: Duration,
    pub(crate) tx: mpsc::Sender<Observation>,
}

#[async_trait]
impl Reconciler for PodReconciler {
    type Key = String;

    async fn reconcile(&self, key: &String) -> anyhow::Result<Requeue> {
        let Some(snapshot) = self.pods.get(key).map(|entry| entry.value().clone()) else {
            // The pod is gone: every container previously attributed to
            // this key gets a removal observation, exactly once.
            if let Some((_, containers)) = self.attributed.remove(key) {
                for container in containers {
                    self.tx
                        .send(Observation::removed(format!("{key}/{container}")))
                        .await
                        .context("observation stream closed")?;
                }
            }
            return Ok(Requeue::Forget);
        };

        debug!(pod = %key, "checking pod");
        let keychain = self.resolve_credentials(&snapshot).await;

        let mut names = Vec::with_capacity(snapshot.containers.len());
        for container in &snapshot.containers {
            names.push(container.name.clone());
            self.tx
                .send(Observation {
                    action: ObservationAction::Added,
                    identity: format!("{key}/{}", container.name),
                    image: Some(container.image.clone()),
                    labels: snapshot.labels.clone(),
                    annotations: snapshot.annotations.clone(),
                    credentials: Some(keychain.clone()),
                })
                .await
                .context("observation stream closed")?;
        }
        self.attributed.insert(key.clone(), names);

        Ok(Requeue::After(
            self.check_interval + random_delay(self.check_interval / 2),
        ))
    }
}

impl PodReconciler {
    /// Gather pull-secret material for the pod: the service account's
    /// secrets first, then the pod spec's own, so the pod's entries win
    /// per host. Any resolution failure skips that secret and continues.
    async fn resolve_credentials(&self, pod: &PodSnapshot) -> Keychain {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut raw = Vec::new();

        if let Some(account) = pod.service_account.as_deref().filter(|name| !name.is_empty()) {
            let accounts: Api<ServiceAccount> =
                Api::namespaced(self.client.clone(), &pod.namespace);
            match accounts.get(account).await {
                Ok(service_account) => {
                    for reference in service_account.image_pull_secrets.unwrap_or_default() {
                        let Some(name) = reference.name else { continue };
                        self.fetch_secret(&secrets, &name, &mut raw).await;
                    }
                }
                Err(error) => warn!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    serviceaccount = %account,
                    error = %error,
                    "error getting service account, trying without its pull secrets"
                ),
            }
        }

        for name in &pod.pull_secrets {
            self.fetch_secret(&secrets, name, &mut raw).await;
        }

        Keychain::from_secrets(&raw)
    }

    async fn fetch_secret(&self, api: &Api<Secret>, name: &str, out: &mut Vec<RawSecret>) {
        match api.get(name).await {
            Ok(secret) => out.push(to_raw_secret(secret)),
            Err(error) => warn!(
                secret = %name,
                error = %error,
                "error getting pull secret, trying without it"
            ),
        }
    }
}

/// Flatten a pull secret into its declared type and credential payload.
/// Both well-known secret shapes keep the document under a single data
/// key; the keychain decides whether the type is usable.
pub(crate) fn to_raw_secret(secret: Secret) -> RawSecret {
    let name = secret.metadata.name.unwrap_or_default();
    let secret_type = secret.type_.unwrap_or_default();
    let mut data = secret.data.unwrap_or_default();
    let payload = data
        .remove(".dockerconfigjson")
        .or_else(|| data.remove(".dockercfg"))
        .map(|bytes| bytes.0)
        .unwrap_or_default();
    RawSecret {
        name,
        secret_type,
        payload,
    }
}

fn random_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max.as_millis() as u64))
}
