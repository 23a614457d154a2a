//! rollcall-core: photo-based classroom attendance.
//!
//! Normalizes uploaded photos, extracts face descriptors with SCRFD detection
//! and ArcFace recognition (ONNX Runtime, CPU), keeps the student roster, and
//! resolves a group photo into a Present/Absent record for every student.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod export;
pub mod extractor;
pub mod normalize;
pub mod notify;
pub mod recognizer;
pub mod roster;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use attendance::{AttendanceRecord, Resolver, Status};
pub use extractor::{FaceEmbedder, OnnxEmbedder};
pub use roster::{Roster, RosterStore};
pub use types::{BoundingBox, Descriptor, EuclideanMatcher, MatchResult, Matcher, RosterEntry};
