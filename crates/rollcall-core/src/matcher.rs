//! Per-frame matching of detected faces against an institution gallery.
//!
//! Each face embedding is compared against every reference embedding; the
//! nearest student wins only if the distance clears the configured
//! threshold, otherwise the face stays unknown. Forcing the nearest label
//! regardless of distance is exactly the lookalike false-positive the
//! threshold exists to reject.

use crate::types::{DetectedFace, GalleryEntry};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// One face's match outcome within a single frame.
///
/// `student_id == None` means the face did not clear the distance
/// threshold against any gallery entry (UNKNOWN).
#[derive(Debug, Clone, Serialize)]
pub struct FrameMatch {
    pub student_id: Option<Uuid>,
    pub distance: f32,
    pub confidence: f32,
}

/// Map a match distance to a confidence in [0, 1].
///
/// Monotonically decreasing in distance: 0 distance → 1.0, at-threshold → 0.0.
pub fn confidence_from_distance(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return 0.0;
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

/// Strategy for matching the faces of one frame against a gallery.
pub trait FrameMatcher: Send + Sync {
    /// Match every detected face independently; deduplicate repeat matches
    /// of the same student within the frame, keeping the best distance.
    fn match_frame(
        &self,
        faces: &[DetectedFace],
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Vec<FrameMatch>;
}

/// Minimum-Euclidean-distance matcher with full gallery scan.
pub struct NearestMatcher;

impl NearestMatcher {
    /// Nearest gallery entry for one probe, or None for an empty gallery.
    fn nearest(probe: &DetectedFace, gallery: &[GalleryEntry]) -> Option<(Uuid, f32)> {
        let mut best: Option<(Uuid, f32)> = None;
        for entry in gallery {
            let dist = probe.embedding.distance(&entry.embedding);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((entry.student_id, dist));
            }
        }
        best
    }
}

impl FrameMatcher for NearestMatcher {
    fn match_frame(
        &self,
        faces: &[DetectedFace],
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Vec<FrameMatch> {
        let mut matches: Vec<FrameMatch> = Vec::with_capacity(faces.len());
        // Index into `matches` for each already-matched student.
        let mut seen: HashMap<Uuid, usize> = HashMap::new();

        for face in faces {
            match Self::nearest(face, gallery) {
                Some((student_id, distance)) if distance <= threshold => {
                    let confidence = confidence_from_distance(distance, threshold);
                    match seen.get(&student_id) {
                        Some(&idx) if matches[idx].distance <= distance => {}
                        Some(&idx) => {
                            matches[idx] = FrameMatch {
                                student_id: Some(student_id),
                                distance,
                                confidence,
                            };
                        }
                        None => {
                            seen.insert(student_id, matches.len());
                            matches.push(FrameMatch {
                                student_id: Some(student_id),
                                distance,
                                confidence,
                            });
                        }
                    }
                }
                Some((_, distance)) => {
                    matches.push(FrameMatch {
                        student_id: None,
                        distance,
                        confidence: 0.0,
                    });
                }
                // Empty gallery: every face is unknown.
                None => {
                    matches.push(FrameMatch {
                        student_id: None,
                        distance: f32::INFINITY,
                        confidence: 0.0,
                    });
                }
            }
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                score: 0.9,
            },
            embedding: Embedding::new(values),
        }
    }

    fn entry(id: Uuid, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            student_id: id,
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_match_below_threshold() {
        let id = Uuid::new_v4();
        let gallery = vec![entry(id, vec![1.0, 0.0])];
        let matches = NearestMatcher.match_frame(&[face(vec![1.0, 0.1])], &gallery, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].student_id, Some(id));
        assert!(matches[0].confidence > 0.0 && matches[0].confidence <= 1.0);
    }

    #[test]
    fn test_unknown_above_threshold() {
        let id = Uuid::new_v4();
        let gallery = vec![entry(id, vec![1.0, 0.0])];
        let matches = NearestMatcher.match_frame(&[face(vec![0.0, 1.0])], &gallery, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].student_id, None);
        assert_eq!(matches[0].confidence, 0.0);
    }

    #[test]
    fn test_nearest_of_several_wins() {
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let gallery = vec![entry(far, vec![0.0, 1.0]), entry(near, vec![1.0, 0.0])];
        let matches = NearestMatcher.match_frame(&[face(vec![0.9, 0.0])], &gallery, 0.5);
        assert_eq!(matches[0].student_id, Some(near));
    }

    #[test]
    fn test_same_student_deduplicated_keeps_best() {
        let id = Uuid::new_v4();
        let gallery = vec![entry(id, vec![1.0, 0.0])];
        // Two faces match the same student; the closer one must survive.
        let faces = vec![face(vec![1.0, 0.3]), face(vec![1.0, 0.1])];
        let matches = NearestMatcher.match_frame(&faces, &gallery, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].student_id, Some(id));
        assert!((matches[0].distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_multiple_faces_matched_independently() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let gallery = vec![entry(a, vec![1.0, 0.0]), entry(b, vec![0.0, 1.0])];
        let faces = vec![face(vec![1.0, 0.05]), face(vec![0.05, 1.0])];
        let matches = NearestMatcher.match_frame(&faces, &gallery, 0.5);
        let ids: Vec<_> = matches.iter().filter_map(|m| m.student_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }

    #[test]
    fn test_empty_gallery_all_unknown() {
        let matches = NearestMatcher.match_frame(&[face(vec![1.0, 0.0])], &[], 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].student_id, None);
    }

    #[test]
    fn test_confidence_monotone_and_bounded() {
        let threshold = 0.5;
        let mut prev = f32::INFINITY;
        for i in 0..20 {
            let d = i as f32 * 0.05;
            let c = confidence_from_distance(d, threshold);
            assert!((0.0..=1.0).contains(&c));
            assert!(c <= prev);
            prev = c;
        }
        assert_eq!(confidence_from_distance(0.0, threshold), 1.0);
        assert_eq!(confidence_from_distance(threshold, threshold), 0.0);
    }
}
