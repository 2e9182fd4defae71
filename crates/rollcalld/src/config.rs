use chrono::Duration;
use rollcall_core::VotingPolicy;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// HTTP listen address (default: 127.0.0.1:8461).
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance for a face to count as a student match.
    pub distance_threshold: f32,
    /// Qualifying matches required across distinct frames (K).
    pub min_frames: u32,
    /// Grace period after session start before a first match counts as late.
    /// Unset disables late marking.
    pub late_after_secs: Option<u64>,
    /// Single-match confidence that short-circuits the K rule. Unset = off.
    pub high_confidence: Option<f32>,
    /// Extraction worker threads.
    pub extract_workers: usize,
    /// Bounded extraction queue depth; frames beyond it are rejected.
    pub queue_depth: usize,
    /// Sessions left active longer than this are auto-ended by the sweep.
    pub max_session_secs: u64,
    /// Sweep scan interval.
    pub sweep_interval_secs: u64,
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            bind_addr: std::env::var("ROLLCALL_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8461".to_string()),
            db_path,
            model_dir,
            distance_threshold: env_f32("ROLLCALL_DISTANCE_THRESHOLD", 0.5),
            min_frames: env_u32("ROLLCALL_MIN_FRAMES", 3),
            late_after_secs: env_opt_u64("ROLLCALL_LATE_AFTER_SECS"),
            high_confidence: env_opt_f32("ROLLCALL_HIGH_CONFIDENCE"),
            extract_workers: env_usize("ROLLCALL_EXTRACT_WORKERS", 2),
            queue_depth: env_usize("ROLLCALL_QUEUE_DEPTH", 16),
            max_session_secs: env_u64("ROLLCALL_MAX_SESSION_SECS", 7200),
            sweep_interval_secs: env_u64("ROLLCALL_SWEEP_INTERVAL_SECS", 60),
            max_frame_bytes: env_usize("ROLLCALL_MAX_FRAME_BYTES", 10 * 1024 * 1024),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_det_640.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn embedding_model_path(&self) -> String {
        self.model_dir
            .join("mobilefacenet.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn voting_policy(&self) -> VotingPolicy {
        VotingPolicy {
            min_frames: self.min_frames,
            late_after: self.late_after_secs.map(|s| Duration::seconds(s as i64)),
            high_confidence: self.high_confidence,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
