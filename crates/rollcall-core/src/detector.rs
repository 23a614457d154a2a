//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the RGB image into the 640×640 model input, decodes the three
//! anchor-free stride heads, and suppresses overlaps with NMS.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Output slots for strides [8, 16, 32], resolved once at load time.
    layout: [StrideSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model with landmarks has 9 outputs, got {}",
                output_names.len()
            )));
        }

        let layout = output_layout(&output_names);
        tracing::debug!(?layout, "SCRFD output layout");

        Ok(Self { session, layout })
    }

    /// Detect faces in an RGB image, returning boxes sorted by descending confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, scale) = letterbox(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slots, &stride) in self.layout.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                scores: extract(slots.score, "scores")?,
                bboxes: extract(slots.bbox, "bboxes")?,
                kps: extract(slots.kps, "kps")?,
            };
            candidates.extend(heads.decode(stride, scale, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detections after NMS");
        Ok(faces)
    }
}

/// Resolve output slots by tensor name ("score_8", "bbox_16", "kps_32", …).
///
/// Exports with generic numeric names use the standard ordering:
/// scores 8/16/32, then bboxes 8/16/32, then kps 8/16/32.
fn output_layout(names: &[String]) -> [StrideSlots; 3] {
    let position = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideSlots {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional layout");
            [
                StrideSlots { score: 0, bbox: 3, kps: 6 },
                StrideSlots { score: 1, bbox: 4, kps: 7 },
                StrideSlots { score: 2, bbox: 5, kps: 8 },
            ]
        }
    }
}

/// Resize into the top-left corner of a 640×640 NCHW tensor, InsightFace style.
///
/// Padding is left at zero, which is exactly the normalized mean. Returns the
/// resize factor used to map detections back to image coordinates.
fn letterbox(image: &RgbImage) -> (Array4<f32>, f32) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width as f32).min(size / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (value as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Raw head outputs for one stride level.
struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHeads<'_> {
    /// Decode anchors above `threshold` into boxes in original image coordinates.
    fn decode(&self, stride: usize, scale: f32, threshold: f32) -> Vec<BoundingBox> {
        let grid = SCRFD_INPUT_SIZE / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let step = stride as f32;

        (0..anchors.min(self.scores.len()))
            .filter(|&idx| self.scores[idx] > threshold)
            .filter_map(|idx| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % grid) as f32 * step;
                let cy = (cell / grid) as f32 * step;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let x1 = (cx - d[0] * step) / scale;
                let y1 = (cy - d[1] * step) / scale;
                let x2 = (cx + d[2] * step) / scale;
                let y2 = (cy + d[3] * step) / scale;

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        (
                            (cx + k[i * 2] * step) / scale,
                            (cy + k[i * 2 + 1] * step) / scale,
                        )
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: self.scores[idx],
                    landmarks,
                })
            })
            .collect()
    }
}

fn by_confidence_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal)
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(by_confidence_desc);

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_half_shifted() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_distinct_faces_in_confidence_order() {
        let result = nms(
            vec![
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_output_layout_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let layout = output_layout(&names);
        assert_eq!(layout[0], StrideSlots { score: 2, bbox: 0, kps: 1 });
        assert_eq!(layout[2], StrideSlots { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (440..449).map(|i: usize| i.to_string()).collect();
        let layout = output_layout(&names);
        assert_eq!(layout[1], StrideSlots { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_letterbox_pads_bottom_right() {
        let image = RgbImage::from_pixel(320, 240, Rgb([255, 255, 255]));
        let (tensor, scale) = letterbox(&image);

        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((scale - 2.0).abs() < 1e-6);

        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 10, 10]] - white).abs() < 1e-6);
        assert!((tensor[[0, 2, 479, 639]] - white).abs() < 1e-6);
        assert_eq!(tensor[[0, 1, 480, 10]], 0.0);
    }

    #[test]
    fn test_decode_maps_back_through_scale() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Cell (row 1, col 3) → anchor centre (96, 32) in letterboxed space.
        let idx = (grid + 3) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let heads = StrideHeads { scores: &scores, bboxes: &bboxes, kps: &kps };
        let faces = heads.decode(stride, 2.0, SCRFD_CONFIDENCE_THRESHOLD);

        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert!((face.x - 32.0).abs() < 1e-4);
        assert!((face.y - 0.0).abs() < 1e-4);
        assert!((face.width - 32.0).abs() < 1e-4);
        assert!((face.height - 32.0).abs() < 1e-4);
        let lms = face.landmarks.unwrap();
        assert!((lms[0].0 - 48.0).abs() < 1e-4 && (lms[0].1 - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_below_threshold_is_empty() {
        let scores = vec![0.5f32; 800];
        let bboxes = vec![0.0f32; 3200];
        let heads = StrideHeads { scores: &scores, bboxes: &bboxes, kps: &[] };
        assert!(heads.decode(32, 1.0, SCRFD_CONFIDENCE_THRESHOLD).is_empty());
    }
}
