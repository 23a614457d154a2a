//! Shared test doubles for extractor-dependent unit tests.

use crate::extractor::{DetectedFace, ExtractError, FaceEmbedder};
use crate::types::{BoundingBox, Descriptor};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;

/// Embedder that "recognizes" faces by the colour of the top-left pixel.
///
/// Uniform synthetic photos survive normalization with their colour intact,
/// so a colour stands in for a person.
#[derive(Default)]
pub(crate) struct ColorKeyedEmbedder {
    faces: HashMap<[u8; 3], Vec<Descriptor>>,
    pub calls: usize,
}

impl ColorKeyedEmbedder {
    pub fn with_faces(mut self, color: [u8; 3], descriptors: Vec<Descriptor>) -> Self {
        self.faces.insert(color, descriptors);
        self
    }
}

impl FaceEmbedder for ColorKeyedEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        self.calls += 1;
        let Some(pixel) = image.pixels().next() else {
            return Ok(Vec::new());
        };
        let descriptors = self.faces.get(&pixel.0).cloned().unwrap_or_default();
        Ok(descriptors
            .into_iter()
            .enumerate()
            .map(|(i, descriptor)| DetectedFace {
                region: BoundingBox {
                    x: i as f32 * 10.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                    confidence: 1.0 - i as f32 * 0.1,
                    landmarks: None,
                },
                descriptor,
            })
            .collect())
    }
}

/// Encode a uniform-colour photo in the given format.
pub(crate) fn photo(color: [u8; 3], width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), format)
        .expect("encode test photo");
    buf
}

pub(crate) fn png(color: [u8; 3]) -> Vec<u8> {
    photo(color, 16, 12, ImageFormat::Png)
}
