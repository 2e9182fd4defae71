//! rollcalld — Attendance session daemon.
//!
//! Wires the matching pipeline together: per-session state machine and
//! vote accumulation, a bounded extraction worker pool, a timeout sweep,
//! and the HTTP surface used by capture clients.

pub mod config;
pub mod http;
pub mod pool;
pub mod sessions;
pub mod sweep;

pub use config::Config;
pub use http::{router, AppState};
pub use pool::{ExtractorFactory, ExtractorPool};
pub use sessions::{SessionError, SessionManager};
