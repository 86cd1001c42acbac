//! Prometheus exposition of the metrics cache
//!
//! Thin read-only adapter: snapshots the cache and renders one gauge
//! family per scrape. The registry hosting the collector is owned by the
//! binary and injected where needed, not a process-wide default.

use std::collections::HashMap;

use prometheus::core::{Collector, Desc};
use prometheus::proto;

use crate::evaluation::MetricsCache;

pub const METRIC_NAME: &str = "container_image_outdated";

const METRIC_HELP: &str =
    "How many major, minor or patch versions a running container image is behind the newest eligible tag";

/// Collector exposing the evaluation pipeline's cache
pub struct DriftCollector {
    cache: MetricsCache,
    desc: Desc,
}

impl DriftCollector {
    pub fn new(cache: MetricsCache) -> Self {
        let desc = Desc::new(
            METRIC_NAME.to_string(),
            METRIC_HELP.to_string(),
            Vec::new(),
            HashMap::new(),
        )
        .expect("static metric descriptor");
        Self { cache, desc }
    }
}

impl Collector for DriftCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let entries = self.cache.snapshot();
        if entries.is_empty() {
            return Vec::new();
        }

        let mut family = proto::MetricFamily::default();
        family.set_name(METRIC_NAME.to_string());
        family.set_help(METRIC_HELP.to_string());
        family.set_field_type(proto::MetricType::GAUGE);

        for entry in entries {
            let mut metric = proto::Metric::default();
            let mut gauge = proto::Gauge::default();
            gauge.set_value(entry.value);
            metric.set_gauge(gauge);
            for (name, value) in entry.labels {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name);
                pair.set_value(value);
                metric.mut_label().push(pair);
            }
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}
