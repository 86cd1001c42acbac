//! Version drift computation
//!
//! Compares the tag a container is running against the tags available
//! upstream and reports how far behind the newest eligible release it is.

use semver::Version;
use thiserror::Error;

/// Constraint limiting which newer versions are eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinMode {
    /// All newer versions are eligible
    #[default]
    None,
    /// Only versions sharing the current major component
    Major,
    /// Only versions sharing the current major and minor components
    Minor,
}

impl PinMode {
    /// Map a workload annotation value to a pin mode. Anything other than
    /// `"major"` or `"minor"` means no pinning.
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            Some("major") => PinMode::Major,
            Some("minor") => PinMode::Minor,
            _ => PinMode::None,
        }
    }
}

/// Distance between the running version and the best eligible newer one
///
/// Only the leading non-zero component is a true distance. When `major` is
/// non-zero, `minor` and `patch` carry the selected version's own
/// components (how far into the next major the upgrade would land); when
/// `major` is zero and `minor` non-zero, `patch` carries the selected
/// version's patch. All-zero means up to date or no eligible candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriftReport {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl DriftReport {
    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.patch == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriftError {
    #[error("current tag {0:?} is not a semantic version")]
    InvalidCurrentVersion(String),
}

/// Compute the drift between `current` and the best candidate in
/// `available`.
///
/// Candidates that do not look like versions (no leading `v` and no dot),
/// fail to parse, are pre-releases, or are not strictly newer than
/// `current` are discarded before the pin filter applies. The maximum
/// remaining candidate under semantic-version ordering determines the
/// report. Pure function: no I/O, no shared state.
pub fn compute_drift(
    current: &str,
    available: &[String],
    pin_mode: PinMode,
) -> Result<DriftReport, DriftError> {
    let current = parse_lenient(current)
        .ok_or_else(|| DriftError::InvalidCurrentVersion(current.to_string()))?;

    let mut selected: Option<Version> = None;
    for raw in available {
        if !raw.starts_with('v') && !raw.contains('.') {
            continue;
        }
        let Some(candidate) = parse_lenient(raw) else {
            continue;
        };
        if !candidate.pre.is_empty() || candidate <= current {
            continue;
        }
        let pinned_out = match pin_mode {
            PinMode::None => false,
            PinMode::Major => candidate.major != current.major,
            PinMode::Minor => {
                candidate.major != current.major || candidate.minor != current.minor
            }
        };
        if pinned_out {
            continue;
        }
        if selected.as_ref().map_or(true, |best| candidate > *best) {
            selected = Some(candidate);
        }
    }

    let Some(selected) = selected else {
        return Ok(DriftReport::default());
    };

    Ok(if selected.major > current.major {
        DriftReport {
            major: selected.major - current.major,
            minor: selected.minor,
            patch: selected.patch,
        }
    } else if selected.minor > current.minor {
        DriftReport {
            major: 0,
            minor: selected.minor - current.minor,
            patch: selected.patch,
        }
    } else {
        DriftReport {
            major: 0,
            minor: 0,
            patch: selected.patch.saturating_sub(current.patch),
        }
    })
}

/// Parse a tag the way images are actually tagged: an optional `v` prefix
/// and up to two omitted trailing segments ("1.25" means "1.25.0").
fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if let Ok(version) = Version::parse(bare) {
        return Some(version);
    }

    let suffix_at = bare
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(bare.len());
    let (core, suffix) = bare.split_at(suffix_at);
    if core.is_empty() || !core.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let segments = core.split('.').count();
    if segments >= 3 {
        return None;
    }
    let padded = format!("{core}{}{suffix}", ".0".repeat(3 - segments));
    Version::parse(&padded).ok()
}
