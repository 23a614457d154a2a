use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance at or below which a probe is accepted as the nearest roster identity.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Identity signature of one detected face (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) distance between two descriptors of equal length.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled student: lowercase identity plus the descriptor of their roster photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity: String,
    pub descriptor: Descriptor,
}

impl RosterEntry {
    pub fn new(identity: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            identity: identity.into(),
            descriptor,
        }
    }
}

/// Title-cased display form of an identity ("mary-jo smith" → "Mary-Jo Smith").
pub fn display_name(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len());
    let mut at_word_start = true;
    for c in identity.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("roster is empty; nothing to match against")]
    EmptyRoster,
    #[error("descriptor length mismatch: probe has {probe}, roster entry {identity:?} has {roster}")]
    DimensionMismatch {
        probe: usize,
        roster: usize,
        identity: String,
    },
}

/// Outcome of matching one probe descriptor against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest roster entry, whether or not it was accepted.
    pub distance: f32,
    /// Identity of the accepted entry. `None` when the nearest entry is beyond tolerance.
    pub identity: Option<String>,
}

/// Strategy for resolving a probe descriptor to at most one roster identity.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Descriptor,
        roster: &[RosterEntry],
        tolerance: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Scans the roster in order and only replaces the current best on a strictly
/// smaller distance, so equal distances resolve to the lowest index.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Descriptor,
        roster: &[RosterEntry],
        tolerance: f32,
    ) -> Result<MatchResult, MatchError> {
        if roster.is_empty() {
            return Err(MatchError::EmptyRoster);
        }

        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in roster.iter().enumerate() {
            if entry.descriptor.len() != probe.len() {
                return Err(MatchError::DimensionMismatch {
                    probe: probe.len(),
                    roster: entry.descriptor.len(),
                    identity: entry.identity.clone(),
                });
            }
            let dist = probe.distance(&entry.descriptor);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_dist <= tolerance => MatchResult {
                matched: true,
                distance: best_dist,
                identity: Some(roster[idx].identity.clone()),
            },
            _ => MatchResult {
                matched: false,
                distance: best_dist,
                identity: None,
            },
        })
    }
}
