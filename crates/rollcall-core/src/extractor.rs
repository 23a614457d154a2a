//! Descriptor extraction: detected face regions plus one descriptor each.
//!
//! The face-embedding capability sits behind [`FaceEmbedder`] so the roster and
//! resolver never depend on ONNX directly.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Descriptor};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One face found in an image.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub descriptor: Descriptor,
}

/// Face detection and embedding in one call.
///
/// Implementations return faces in descending detection confidence. An empty
/// result means "no face found" and is not an error.
pub trait FaceEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError>;
}

/// SCRFD detection followed by ArcFace embedding of each detected face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let regions = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(regions.len());

        for region in regions {
            match self.recognizer.describe(image, &region) {
                Ok(descriptor) => faces.push(DetectedFace { region, descriptor }),
                Err(RecognizerError::NoLandmarks | RecognizerError::DegenerateLandmarks) => {
                    tracing::debug!(confidence = region.confidence, "skipping face that cannot be aligned");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}

/// All faces in `image`. Zero faces is a valid result.
pub fn extract(
    embedder: &mut dyn FaceEmbedder,
    image: &RgbImage,
) -> Result<Vec<DetectedFace>, ExtractError> {
    let faces = embedder.detect_and_embed(image)?;
    tracing::debug!(
        faces = faces.len(),
        width = image.width(),
        height = image.height(),
        "extracted descriptors"
    );
    Ok(faces)
}

/// Single-face contract used for enrollment and roster loading.
///
/// Uses the first (most confident) face when several are present.
pub fn extract_single(
    embedder: &mut dyn FaceEmbedder,
    image: &RgbImage,
) -> Result<Descriptor, ExtractError> {
    let mut faces = extract(embedder, image)?;
    if faces.len() > 1 {
        tracing::warn!(faces = faces.len(), "multiple faces in single-face photo; using the first");
    }
    if faces.is_empty() {
        return Err(ExtractError::NoFaceDetected);
    }
    Ok(faces.swap_remove(0).descriptor)
}
