//! rollcall-core — Attendance-session face matching.
//!
//! Per-frame nearest-neighbor matching against a per-institution gallery,
//! plus the session voting engine that turns frame-level candidates into
//! final presence decisions via a K-frame consistency rule.

pub mod extractor;
pub mod matcher;
pub mod types;
pub mod voting;

pub use extractor::{EmbeddingExtractor, ExtractionError, OnnxExtractor};
pub use matcher::{FrameMatch, FrameMatcher, NearestMatcher};
pub use types::{AttendanceStatus, BoundingBox, DetectedFace, Embedding, GalleryEntry};
pub use voting::{FinalMark, SessionVotes, VoteTally, VotingPolicy};
