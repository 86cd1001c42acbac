//! Core data types shared by source adapters and the evaluation pipeline

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::keychain::Keychain;

/// Lifecycle action reported for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationAction {
    Added,
    Removed,
}

impl fmt::Display for ObservationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationAction::Added => f.write_str("added"),
            ObservationAction::Removed => f.write_str("removed"),
        }
    }
}

/// A single observation of a container emitted by a source adapter
///
/// The identity is stable across repeated observations of the same logical
/// container, so `Added`/`Removed` pairs correlate.
#[derive(Debug, Clone)]
pub struct Observation {
    pub action: ObservationAction,
    /// Stable key correlating repeated observations of the same container
    pub identity: String,
    /// Raw image reference, present for `Added` observations
    pub image: Option<String>,
    /// Workload labels, e.g. pod labels or engine container labels
    pub labels: HashMap<String, String>,
    /// Workload annotations
    pub annotations: HashMap<String, String>,
    /// Registry credentials scoped to this observation
    pub credentials: Option<Keychain>,
}

impl Observation {
    /// A removal observation carries nothing but the identity.
    pub fn removed(identity: impl Into<String>) -> Self {
        Self {
            action: ObservationAction::Removed,
            identity: identity.into(),
            image: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            credentials: None,
        }
    }
}

/// One exported gauge sample: a label set and its value
///
/// Labels are kept sorted so the exposition output is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}
