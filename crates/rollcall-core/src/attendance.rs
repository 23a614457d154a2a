//! Attendance resolution: one group photo in, one Present/Absent per student out.

use crate::extractor::{self, ExtractError, FaceEmbedder};
use crate::normalize::{self, NormalizeError, DEFAULT_MAX_DIMENSION};
use crate::types::{EuclideanMatcher, MatchError, Matcher, RosterEntry, DEFAULT_TOLERANCE};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Present,
    Absent,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Present => "Present",
            Status::Absent => "Absent",
        })
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(Status::Present),
            "absent" => Ok(Status::Absent),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

/// Status of every roster identity for one attendance run, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendanceRecord {
    statuses: BTreeMap<String, Status>,
}

impl AttendanceRecord {
    /// Every identity starts out Absent.
    pub fn all_absent<'a>(identities: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            statuses: identities
                .into_iter()
                .map(|id| (id.to_string(), Status::Absent))
                .collect(),
        }
    }

    /// Record from manually entered statuses. Roster identities missing from
    /// `statuses` are Absent; entries for unknown identities are dropped.
    pub fn from_manual<'a>(
        identities: impl IntoIterator<Item = &'a str>,
        statuses: impl IntoIterator<Item = (String, Status)>,
    ) -> Self {
        let mut record = Self::all_absent(identities);
        for (identity, status) in statuses {
            let identity = identity.trim().to_lowercase();
            if !record.set(&identity, status) {
                tracing::debug!(%identity, "ignoring status for unknown identity");
            }
        }
        record
    }

    /// Mark a known identity Present. Unknown identities are ignored (returns false).
    pub fn mark_present(&mut self, identity: &str) -> bool {
        match self.statuses.get_mut(identity) {
            Some(status) => {
                *status = Status::Present;
                true
            }
            None => false,
        }
    }

    pub fn set(&mut self, identity: &str, status: Status) -> bool {
        match self.statuses.get_mut(identity) {
            Some(slot) => {
                *slot = status;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, identity: &str) -> Option<Status> {
        self.statuses.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// `(identity, status)` pairs sorted by identity.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Status)> {
        self.statuses.iter().map(|(id, s)| (id.as_str(), *s))
    }

    pub fn absentees(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, s)| *s == Status::Absent)
            .map(|(id, _)| id)
    }

    pub fn present_count(&self) -> usize {
        self.iter().filter(|(_, s)| *s == Status::Present).count()
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Turns group photos into attendance records.
pub struct Resolver {
    matcher: Box<dyn Matcher + Send + Sync>,
    tolerance: f32,
    max_dimension: u32,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl Resolver {
    /// Euclidean nearest-neighbour matching with the given tolerance.
    pub fn new(tolerance: f32) -> Self {
        Self {
            matcher: Box::new(EuclideanMatcher),
            tolerance,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + Send + Sync + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Normalize the uploaded group photo, then [`resolve_image`](Self::resolve_image).
    pub fn resolve(
        &self,
        embedder: &mut dyn FaceEmbedder,
        photo: &[u8],
        roster: &[RosterEntry],
    ) -> Result<AttendanceRecord, ResolveError> {
        let image = normalize::normalize_bytes(photo, self.max_dimension)?;
        self.resolve_image(embedder, &image, roster)
    }

    /// Match every face in `image` independently against the full roster.
    ///
    /// Several faces matching one identity leave it Present once.
    pub fn resolve_image(
        &self,
        embedder: &mut dyn FaceEmbedder,
        image: &RgbImage,
        roster: &[RosterEntry],
    ) -> Result<AttendanceRecord, ResolveError> {
        let mut record = AttendanceRecord::all_absent(roster.iter().map(|e| e.identity.as_str()));
        if roster.is_empty() {
            tracing::info!("roster is empty; nothing to match");
            return Ok(record);
        }

        let faces = extractor::extract(embedder, image)?;
        let mut unknown = 0usize;

        for face in &faces {
            let result = match self.matcher.compare(&face.descriptor, roster, self.tolerance) {
                Ok(result) => result,
                Err(MatchError::EmptyRoster) => break,
                Err(e) => return Err(e.into()),
            };
            match result.identity {
                Some(identity) => {
                    if record.status(&identity) == Some(Status::Present) {
                        tracing::debug!(%identity, "identity matched by more than one face");
                    }
                    record.mark_present(&identity);
                    tracing::debug!(%identity, distance = result.distance, "face matched");
                }
                None => {
                    unknown += 1;
                    tracing::debug!(distance = result.distance, "face not recognized");
                }
            }
        }

        tracing::info!(
            faces = faces.len(),
            unknown,
            present = record.present_count(),
            students = record.len(),
            "attendance resolved"
        );
        Ok(record)
    }
}
