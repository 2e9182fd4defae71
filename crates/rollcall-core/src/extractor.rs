//! ONNX-backed face embedding extraction.
//!
//! Two-stage pipeline: a detection model proposes face boxes over a
//! 640x640 letter-free resize, then each crop is embedded by a
//! MobileFaceNet-style model into a 128-dimensional L2-normalized vector.
//! Callers that cannot run inference (tests, remote extraction) implement
//! [`EmbeddingExtractor`] themselves.

use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: u32 = 640;
const DET_SCORE_THRESHOLD: f32 = 0.6;
const DET_IOU_THRESHOLD: f32 = 0.4;
const DET_MAX_FACES: usize = 32;

const EMB_INPUT_SIZE: u32 = 112;
const EMB_MEAN: f32 = 127.5;
const EMB_STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 128;
const EMBEDDING_MODEL_VERSION: &str = "mobilefacenet";

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("undecodable frame image: {0}")]
    BadImage(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces zero or more (box, embedding) pairs from an encoded image.
///
/// Deterministic for identical input bytes, up to floating-point
/// nondeterminism of the inference backend.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError>;
}

/// Detection + embedding via ONNX Runtime, CPU inference.
pub struct OnnxExtractor {
    detector: Session,
    embedder: Session,
}

impl OnnxExtractor {
    /// Load both models. Fails fast on missing files.
    pub fn load(detector_path: &str, embedder_path: &str) -> Result<Self, ExtractionError> {
        for path in [detector_path, embedder_path] {
            if !Path::new(path).exists() {
                return Err(ExtractionError::ModelNotFound(path.to_string()));
            }
        }

        let detector = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(detector_path)?;
        tracing::info!(path = detector_path, "face detection model loaded");

        let embedder = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(embedder_path)?;
        tracing::info!(path = embedder_path, "face embedding model loaded");

        Ok(Self { detector, embedder })
    }

    fn detect(&mut self, rgb: &RgbImage) -> Result<Vec<BoundingBox>, ExtractionError> {
        let input = det_preprocess(rgb);
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("face detection: {e}")))?;

        let sx = rgb.width() as f32 / DET_INPUT_SIZE as f32;
        let sy = rgb.height() as f32 / DET_INPUT_SIZE as f32;
        let candidates = decode_detections(raw, sx, sy, DET_SCORE_THRESHOLD);
        Ok(nms(candidates, DET_IOU_THRESHOLD, DET_MAX_FACES))
    }

    fn embed(&mut self, rgb: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, ExtractionError> {
        let crop = crop_face(rgb, bbox);
        let resized = imageops::resize(&crop, EMB_INPUT_SIZE, EMB_INPUT_SIZE, FilterType::Triangle);
        let input = emb_preprocess(&resized);

        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractionError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let mut embedding = Embedding {
            values: raw.to_vec(),
            model_version: Some(EMBEDDING_MODEL_VERSION.to_string()),
        };
        embedding.normalize();
        Ok(embedding)
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractionError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let boxes = self.detect(&rgb)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.embed(&rgb, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }

        tracing::debug!(faces = faces.len(), "frame extracted");
        Ok(faces)
    }
}

/// Resize to the detector's square input and scale pixels to [0, 1], NCHW.
fn det_preprocess(rgb: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(rgb, DET_INPUT_SIZE, DET_INPUT_SIZE, FilterType::Triangle);
    let size = DET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Symmetric normalization for the embedding model, NCHW.
fn emb_preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = EMB_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMB_MEAN) / EMB_STD;
        }
    }
    tensor
}

/// Decode raw `[N, 5]` detector output (cx, cy, w, h, score in detector-input
/// pixels) into image-space boxes, dropping low scores.
fn decode_detections(raw: &[f32], sx: f32, sy: f32, score_threshold: f32) -> Vec<BoundingBox> {
    let mut boxes = Vec::new();
    for row in raw.chunks_exact(5) {
        let (cx, cy, w, h, score) = (row[0], row[1], row[2], row[3], row[4]);
        if score < score_threshold || w <= 0.0 || h <= 0.0 {
            continue;
        }
        boxes.push(BoundingBox {
            x: (cx - w / 2.0) * sx,
            y: (cy - h / 2.0) * sy,
            width: w * sx,
            height: h * sy,
            score,
        });
    }
    boxes
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32, max_faces: usize) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.len() == max_faces {
            break;
        }
        if kept.iter().all(|k| k.iou(&candidate) < iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Crop a detection out of the frame, clamped to image bounds.
fn crop_face(rgb: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let x = bbox.x.max(0.0) as u32;
    let y = bbox.y.max(0.0) as u32;
    let x = x.min(rgb.width().saturating_sub(1));
    let y = y.min(rgb.height().saturating_sub(1));
    let w = (bbox.width as u32).clamp(1, rgb.width() - x);
    let h = (bbox.height as u32).clamp(1, rgb.height() - y);
    imageops::crop_imm(rgb, x, y, w, h).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_det_preprocess_shape_and_range() {
        let rgb = RgbImage::from_pixel(320, 240, image::Rgb([255, 0, 128]));
        let tensor = det_preprocess(&rgb);
        assert_eq!(
            tensor.shape(),
            &[1, 3, DET_INPUT_SIZE as usize, DET_INPUT_SIZE as usize]
        );
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 0, 0]].abs() < 1e-6);
    }

    #[test]
    fn test_emb_preprocess_normalization() {
        // Midpoint pixel value normalizes close to zero.
        let crop = RgbImage::from_pixel(EMB_INPUT_SIZE, EMB_INPUT_SIZE, image::Rgb([128, 128, 128]));
        let tensor = emb_preprocess(&crop);
        let expected = (128.0 - EMB_MEAN) / EMB_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 5]], tensor[[0, 2, 5, 5]]);
    }

    #[test]
    fn test_decode_filters_low_scores() {
        // Two rows: one above threshold, one below.
        let raw = [
            100.0, 100.0, 40.0, 40.0, 0.9, //
            200.0, 200.0, 40.0, 40.0, 0.2,
        ];
        let boxes = decode_detections(&raw, 1.0, 1.0, 0.6);
        assert_eq!(boxes.len(), 1);
        assert!((boxes[0].x - 80.0).abs() < 1e-4);
        assert!((boxes[0].width - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_scales_to_image_space() {
        let raw = [320.0, 320.0, 64.0, 64.0, 0.9];
        let boxes = decode_detections(&raw, 2.0, 0.5, 0.6);
        assert!((boxes[0].width - 128.0).abs() < 1e-4);
        assert!((boxes[0].height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let mk = |x: f32, score: f32| BoundingBox {
            x,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            score,
        };
        // Second box overlaps the first heavily; third is far away.
        let boxes = vec![mk(0.0, 0.8), mk(10.0, 0.9), mk(500.0, 0.7)];
        let kept = nms(boxes, 0.4, 32);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn test_nms_respects_max_faces() {
        let boxes = (0..10)
            .map(|i| BoundingBox {
                x: i as f32 * 300.0,
                y: 0.0,
                width: 100.0,
                height: 100.0,
                score: 0.9,
            })
            .collect();
        assert_eq!(nms(boxes, 0.4, 4).len(), 4);
    }

    #[test]
    fn test_crop_face_clamps_to_bounds() {
        let rgb = RgbImage::new(100, 100);
        let bbox = BoundingBox {
            x: 80.0,
            y: -10.0,
            width: 50.0,
            height: 50.0,
            score: 0.9,
        };
        let crop = crop_face(&rgb, &bbox);
        assert!(crop.width() <= 20);
        assert!(crop.height() <= 50);
        assert!(crop.width() >= 1 && crop.height() >= 1);
    }
}
