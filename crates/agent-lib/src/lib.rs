//! Core library for the image drift agent
//!
//! This crate provides:
//! - Source adapters that turn a running container fleet into a stream of
//!   add/remove observations (Kubernetes reconciler, Docker engine events)
//! - Registry credential resolution and credential-aware tag listing
//! - The version drift algorithm
//! - The concurrent evaluation pipeline, its metrics cache, and the
//!   Prometheus collector over it

pub mod drift;
pub mod evaluation;
pub mod exporter;
pub mod image;
pub mod keychain;
pub mod models;
pub mod reconcile;
pub mod registry;
pub mod source;

pub use drift::{compute_drift, DriftReport, PinMode};
pub use evaluation::{Evaluator, MetricsCache};
pub use exporter::DriftCollector;
pub use keychain::{Credential, Keychain};
pub use models::{MetricEntry, Observation, ObservationAction};
pub use registry::{RegistryClient, TagLister};
pub use source::{ContainerSource, SourceKind};
