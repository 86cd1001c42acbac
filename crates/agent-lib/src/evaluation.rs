//! Concurrent evaluation pipeline
//!
//! Consumes the observation stream with a fixed worker pool, resolves
//! each container's current tag and candidate tags, computes drift, and
//! maintains the metrics cache that the exporter snapshots. Evaluation
//! errors drop the observation; the source adapter's periodic recheck is
//! the retry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::drift::{compute_drift, DriftReport, PinMode};
use crate::models::{MetricEntry, Observation, ObservationAction};
use crate::registry::TagLister;
use crate::source::ContainerSource;

/// Size of the evaluation worker pool
pub const WORKER_COUNT: usize = 4;

/// Workload annotation selecting the pin mode for drift computation
pub const PIN_MODE_ANNOTATION: &str = "drift-agent.io/pin-mode";

const CONTAINER_LABEL: &str = "container";
const TYPE_LABEL: &str = "type";

/// Per-container metric entries behind a single read/write lock
///
/// Owned by the evaluation pipeline: workers insert and remove entries
/// under the write lock, the exporter snapshots under the read lock.
/// Nothing survives a restart; the cache rebuilds from the adapter's
/// initial enumeration.
#[derive(Clone, Default)]
pub struct MetricsCache {
    inner: Arc<RwLock<HashMap<String, Vec<MetricEntry>>>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<MetricEntry>>> {
        self.inner.read().expect("metrics cache lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<MetricEntry>>> {
        self.inner.write().expect("metrics cache lock poisoned")
    }

    /// Replace the entries for an identity. Written by pipeline workers
    /// on every successful evaluation.
    pub fn insert(&self, identity: String, entries: Vec<MetricEntry>) {
        self.write().insert(identity, entries);
    }

    /// Drop an identity's entries wholesale.
    pub fn remove(&self, identity: &str) {
        self.write().remove(identity);
    }

    /// Flatten the cache into a list of entries. Callable concurrently
    /// with ongoing evaluation; writers are only blocked for the copy.
    pub fn snapshot(&self) -> Vec<MetricEntry> {
        self.read().values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// The evaluation pipeline: source in, metrics cache out
pub struct Evaluator {
    tag_lister: Arc<dyn TagLister>,
    source: Arc<dyn ContainerSource>,
    cache: MetricsCache,
}

impl Evaluator {
    pub fn new(
        tag_lister: Arc<dyn TagLister>,
        source: Arc<dyn ContainerSource>,
        cache: MetricsCache,
    ) -> Self {
        Self {
            tag_lister,
            source,
            cache,
        }
    }

    /// A shared handle to the cache this pipeline maintains.
    pub fn cache(&self) -> MetricsCache {
        self.cache.clone()
    }

    /// Start the worker pool over the source's observation stream and run
    /// until the stream closes or the shutdown signal fires.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let receiver = self.source.observe(shutdown.resubscribe()).await?;
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for worker in 0..WORKER_COUNT {
            workers.push(tokio::spawn(worker_loop(
                worker,
                receiver.clone(),
                self.tag_lister.clone(),
                self.cache.clone(),
                shutdown.resubscribe(),
            )));
        }
        drop(shutdown);

        for worker in workers {
            worker.await?;
        }
        Ok(())
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Observation>>>,
    tag_lister: Arc<dyn TagLister>,
    cache: MetricsCache,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(worker, "evaluation worker started");
    loop {
        let mut guard = receiver.lock().await;
        let observation = tokio::select! {
            _ = shutdown.recv() => None,
            observation = guard.recv() => observation,
        };
        drop(guard);

        let Some(observation) = observation else { break };
        evaluate(tag_lister.as_ref(), &cache, observation).await;
    }
    debug!(worker, "evaluation worker stopped");
}

async fn evaluate(tag_lister: &dyn TagLister, cache: &MetricsCache, observation: Observation) {
    match observation.action {
        ObservationAction::Removed => {
            debug!(identity = %observation.identity, "container removed, dropping metrics");
            cache.remove(&observation.identity);
        }
        ObservationAction::Added => {
            let identity = observation.identity.clone();
            let Some(image) = observation.image.clone() else {
                warn!(identity = %identity, "added observation without an image, dropping");
                return;
            };

            let pin_mode = PinMode::from_annotation(
                observation
                    .annotations
                    .get(PIN_MODE_ANNOTATION)
                    .map(String::as_str),
            );

            let current = match tag_lister.current_tag(&image) {
                Ok(tag) => tag,
                Err(error) => {
                    warn!(identity = %identity, image = %image, error = %error, "invalid image reference, dropping observation");
                    return;
                }
            };

            let keychain = observation.credentials.clone().unwrap_or_default();
            let tags = match tag_lister.list_tags(&image, &keychain).await {
                Ok(tags) => tags,
                Err(error) => {
                    warn!(identity = %identity, image = %image, error = %error, "failed to list tags, will retry on the next recheck");
                    return;
                }
            };

            let report = match compute_drift(&current, &tags, pin_mode) {
                Ok(report) => report,
                Err(error) => {
                    // Plenty of images run non-semver tags; not worth a
                    // warning every recheck.
                    debug!(identity = %identity, image = %image, error = %error, "skipping drift computation");
                    return;
                }
            };

            info!(
                identity = %identity,
                image = %image,
                major = report.major,
                minor = report.minor,
                patch = report.patch,
                "image drift evaluated"
            );
            cache.insert(identity, metric_entries(&observation, report));
        }
    }
}

/// Build the three per-component gauge entries for an evaluated container.
fn metric_entries(observation: &Observation, report: DriftReport) -> Vec<MetricEntry> {
    let mut base: BTreeMap<String, String> = observation
        .labels
        .iter()
        .map(|(key, value)| (sanitize_label_key(key), value.clone()))
        .collect();
    base.insert(CONTAINER_LABEL.to_string(), observation.identity.clone());

    [
        ("major", report.major),
        ("minor", report.minor),
        ("patch", report.patch),
    ]
    .into_iter()
    .map(|(component, value)| {
        let mut labels = base.clone();
        labels.insert(TYPE_LABEL.to_string(), component.to_string());
        MetricEntry {
            labels,
            value: value as f64,
        }
    })
    .collect()
}

/// Replace characters the exposition format rejects. The result always
/// matches `[a-zA-Z_][a-zA-Z0-9_]*`, and sanitizing twice equals
/// sanitizing once.
pub fn sanitize_label_key(key: &str) -> String {
    let mut sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized
        .chars()
        .next()
        .map_or(true, |c| c.is_ascii_digit())
    {
        sanitized.insert(0, '_');
    }
    sanitized
}
