//! Roster store: enrolled identities and their descriptors, backed by a
//! directory holding one photo per identity (`{identity}.{jpg,jpeg,png}`).
//!
//! The in-memory [`Roster`] is a single sequence of [`RosterEntry`] records
//! behind an `Arc`: readers take a cheap snapshot, writers copy on write.
//! Each identity appears at most once; re-enrolling replaces in place.

use crate::extractor::{self, ExtractError, FaceEmbedder};
use crate::normalize::{self, NormalizeError, DEFAULT_MAX_DIMENSION, ENROLL_MAX_DIMENSION};
use crate::types::{Descriptor, RosterEntry};
use image::RgbImage;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Photo extensions accepted for roster images (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("unsupported photo format: {0:?} (need .jpg, .jpeg or .png)")]
    UnsupportedFormat(String),
    #[error("invalid student name: {0:?}")]
    InvalidIdentity(String),
    #[error("no face detected in enrollment photo")]
    NoFaceDetected,
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Extract(ExtractError),
    #[error("failed to write roster image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExtractError> for RosterError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NoFaceDetected => RosterError::NoFaceDetected,
            other => RosterError::Extract(other),
        }
    }
}

/// Whether an upsert added a new identity or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Appended,
    Replaced,
}

/// Enrolled identities in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Arc<Vec<RosterEntry>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    /// Shared read-only view that later mutations of this roster do not affect.
    pub fn snapshot(&self) -> Arc<Vec<RosterEntry>> {
        Arc::clone(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.position(identity).is_some()
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identity.as_str())
    }

    fn position(&self, identity: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity == identity)
    }

    /// Append a new identity, or replace the descriptor of an existing one at its index.
    pub fn upsert(&mut self, entry: RosterEntry) -> Upsert {
        let position = self.position(&entry.identity);
        let entries = Arc::make_mut(&mut self.entries);
        match position {
            Some(idx) => {
                entries[idx] = entry;
                Upsert::Replaced
            }
            None => {
                entries.push(entry);
                Upsert::Appended
            }
        }
    }

    pub fn remove(&mut self, identity: &str) -> Option<RosterEntry> {
        let idx = self.position(identity)?;
        Some(Arc::make_mut(&mut self.entries).remove(idx))
    }
}

/// Lowercase, trimmed identity that is also safe to use as a file stem.
pub fn normalize_identity(raw: &str) -> Result<String, RosterError> {
    let identity = raw.trim().to_lowercase();
    let unsafe_stem = identity.is_empty()
        || identity.starts_with('.')
        || identity
            .chars()
            .any(|c| c.is_control() || matches!(c, '/' | '\\' | ':'));
    if unsafe_stem {
        return Err(RosterError::InvalidIdentity(raw.to_string()));
    }
    Ok(identity)
}

/// The allow-listed extension of `path`, lowercased.
pub fn supported_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.iter().copied().find(|s| *s == ext)
}

/// A normalized enrollment photo and its descriptor, ready to be committed.
pub struct Enrollment {
    identity: String,
    extension: &'static str,
    image: RgbImage,
    descriptor: Descriptor,
}

impl Enrollment {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

/// Directory-backed roster persistence.
#[derive(Debug, Clone)]
pub struct RosterStore {
    dir: PathBuf,
    /// Where published copies of roster photos go (served to viewers).
    publish_dir: Option<PathBuf>,
    rewrite_on_load: bool,
    load_max_dimension: u32,
    enroll_max_dimension: u32,
}

impl RosterStore {
    /// Open (creating if needed) the roster directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RosterError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            publish_dir: None,
            rewrite_on_load: false,
            load_max_dimension: DEFAULT_MAX_DIMENSION,
            enroll_max_dimension: ENROLL_MAX_DIMENSION,
        })
    }

    pub fn with_publish_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.publish_dir = Some(dir.into());
        self
    }

    /// Write RGB conversions of non-RGB roster photos back to disk while loading.
    pub fn with_rewrite_on_load(mut self, rewrite: bool) -> Self {
        self.rewrite_on_load = rewrite;
        self
    }

    pub fn with_max_dimensions(mut self, load: u32, enroll: u32) -> Self {
        self.load_max_dimension = load;
        self.enroll_max_dimension = enroll;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuild the roster from every allow-listed photo in the directory.
    ///
    /// Photos that cannot be decoded or contain no face are logged and skipped.
    /// Order follows directory enumeration and is not meaningful.
    pub fn load_all(&self, embedder: &mut dyn FaceEmbedder) -> Result<Roster, RosterError> {
        let mut roster = Roster::new();

        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if !path.is_file() || supported_extension(&path).is_none() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let identity = match normalize_identity(stem) {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(path = %path.display(), "unusable file name, skipping");
                    continue;
                }
            };

            let image =
                match normalize::normalize_file(&path, self.load_max_dimension, self.rewrite_on_load) {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "cannot load roster photo, skipping");
                        continue;
                    }
                };

            let descriptor = match extractor::extract_single(embedder, &image) {
                Ok(d) => d,
                Err(ExtractError::NoFaceDetected) => {
                    tracing::warn!(path = %path.display(), "no face found, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "descriptor extraction failed, skipping");
                    continue;
                }
            };

            if roster.upsert(RosterEntry::new(identity.clone(), descriptor)) == Upsert::Replaced {
                tracing::warn!(%identity, path = %path.display(), "several photos for one student; last one wins");
            }
        }

        tracing::info!(
            dir = %self.dir.display(),
            students = ?roster.identities().collect::<Vec<_>>(),
            "roster loaded"
        );
        Ok(roster)
    }

    /// Validate, normalize and describe an enrollment photo. Touches nothing on disk.
    pub fn prepare_enrollment(
        &self,
        identity: &str,
        filename: &str,
        bytes: &[u8],
        embedder: &mut dyn FaceEmbedder,
    ) -> Result<Enrollment, RosterError> {
        let extension = supported_extension(Path::new(filename))
            .ok_or_else(|| RosterError::UnsupportedFormat(filename.to_string()))?;
        let identity = normalize_identity(identity)?;
        let image = normalize::normalize_bytes(bytes, self.enroll_max_dimension)?;
        let descriptor = extractor::extract_single(embedder, &image)?;

        Ok(Enrollment {
            identity,
            extension,
            image,
            descriptor,
        })
    }

    /// Persist the normalized photo and insert the identity into `roster`.
    ///
    /// The roster is only touched once the photo is on disk; a failed write
    /// leaves no file behind.
    pub fn commit_enrollment(
        &self,
        roster: &mut Roster,
        enrollment: Enrollment,
    ) -> Result<Upsert, RosterError> {
        let Enrollment {
            identity,
            extension,
            image,
            descriptor,
        } = enrollment;

        // Encode beside the target, then rename over it; an earlier photo
        // survives any failure. The leading dot keeps load_all away from it.
        let path = self.dir.join(format!("{identity}.{extension}"));
        let staged = self.dir.join(format!(".{identity}.staged.{extension}"));
        if let Err(e) = image.save(&staged) {
            remove_quietly(&staged);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&staged, &path) {
            remove_quietly(&staged);
            return Err(e.into());
        }

        for ext in SUPPORTED_EXTENSIONS.iter().filter(|e| **e != extension) {
            remove_quietly(&self.dir.join(format!("{identity}.{ext}")));
        }
        self.unpublish(&identity);

        let upsert = roster.upsert(RosterEntry::new(identity.clone(), descriptor));
        tracing::info!(%identity, path = %path.display(), ?upsert, "student enrolled");
        Ok(upsert)
    }

    /// Enroll in one step: [`prepare_enrollment`](Self::prepare_enrollment) then
    /// [`commit_enrollment`](Self::commit_enrollment).
    pub fn enroll(
        &self,
        roster: &mut Roster,
        identity: &str,
        filename: &str,
        bytes: &[u8],
        embedder: &mut dyn FaceEmbedder,
    ) -> Result<Upsert, RosterError> {
        let enrollment = self.prepare_enrollment(identity, filename, bytes, embedder)?;
        self.commit_enrollment(roster, enrollment)
    }

    /// Remove `identity` from memory and delete its photos and published copies.
    ///
    /// Returns whether the identity was enrolled. File cleanup runs either way.
    pub fn remove(&self, roster: &mut Roster, identity: &str) -> Result<bool, RosterError> {
        let identity = normalize_identity(identity)?;
        let removed = roster.remove(&identity).is_some();

        for ext in SUPPORTED_EXTENSIONS {
            remove_quietly(&self.dir.join(format!("{identity}.{ext}")));
        }
        self.unpublish(&identity);

        tracing::info!(%identity, removed, "student removed");
        Ok(removed)
    }

    /// Path of the stored photo for `identity`, if any.
    pub fn image_path(&self, identity: &str) -> Option<PathBuf> {
        SUPPORTED_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{identity}.{ext}")))
            .find(|p| p.is_file())
    }

    /// Copy the identity's photo into the publish directory if not already there.
    ///
    /// Returns the published path, or the roster path when no publish
    /// directory is configured or the copy fails.
    pub fn publish_image(&self, identity: &str) -> Option<PathBuf> {
        let source = self.image_path(identity)?;
        let Some(publish_dir) = &self.publish_dir else {
            return Some(source);
        };
        let target = publish_dir.join(source.file_name()?);
        if target.is_file() {
            return Some(target);
        }

        let copied = std::fs::create_dir_all(publish_dir).and_then(|_| std::fs::copy(&source, &target));
        match copied {
            Ok(_) => Some(target),
            Err(e) => {
                tracing::warn!(%identity, error = %e, "failed to publish roster photo");
                Some(source)
            }
        }
    }

    fn unpublish(&self, identity: &str) {
        if let Some(publish_dir) = &self.publish_dir {
            for ext in SUPPORTED_EXTENSIONS {
                remove_quietly(&publish_dir.join(format!("{identity}.{ext}")));
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
